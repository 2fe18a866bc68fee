//! Device session lifecycle.
//!
//! A [`Session`] walks through bring-up strictly in sequence: the transport
//! is connected, the token is presented, then every bridge link is bound.
//! Only an authenticated session can be started. [`Session::start`] splits
//! the connection into the single reader and the single writer, starts the
//! heartbeat and a supervisor, and returns a [`SessionHandle`].
//!
//! The supervisor waits for the first context to stop and tears the rest
//! down in a fixed order: stop the heartbeat, fail every pending request,
//! close the writer, then release the read half. The outcome is reported
//! as a [`SessionEnd`].

use std::{fmt, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_util::{
    codec::{Framed, FramedParts, FramedRead},
    sync::CancellationToken,
};
use tracing::{error, info, warn};

use crate::{
    bridge::{BridgeForwarder, BridgeLink},
    bus::MessageBus,
    codec::{CodecError, FrameCodec},
    config::SessionConfig,
    correlation::PendingTable,
    dispatch::CommandDispatcher,
    error::{BridgeError, Result},
    handshake::Handshake,
    heartbeat::{HeartbeatKeeper, HeartbeatStop, Liveness},
    pins::PinCache,
    reader::{ConnectionReader, ReaderExit},
    router::TopicRouter,
    writer::frame_channel,
};

/// Bring-up state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No transport yet.
    Disconnected,
    /// Transport established.
    Connecting,
    /// Login sent, waiting for the verdict.
    Authenticating,
    /// Login accepted.
    Authenticated,
    /// Bring-up failed or the session ended.
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal step.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{Authenticated, Authenticating, Closed, Connecting, Disconnected};
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Authenticated)
                | (Disconnected | Connecting | Authenticating | Authenticated, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

/// Why a started session stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// Shutdown was requested through the handle.
    Shutdown,
    /// The peer closed the connection between frames.
    PeerClosed,
    /// No inbound traffic for the configured number of heartbeats.
    PeerSilent {
        /// How long the peer had been quiet.
        idle: Duration,
    },
    /// The connection failed.
    Transport(BridgeError),
    /// The peer violated the protocol.
    Protocol(CodecError),
}

impl SessionEnd {
    /// Whether the session ended because it was asked to.
    #[must_use]
    pub fn is_requested(&self) -> bool { matches!(self, Self::Shutdown) }

    fn from_codec(error: CodecError) -> Self {
        match error {
            CodecError::Io(io) => Self::Transport(BridgeError::Transport(io)),
            eof @ CodecError::Eof(_) => Self::Transport(BridgeError::Codec(eof)),
            other => Self::Protocol(other),
        }
    }

    fn from_join(error: &tokio::task::JoinError) -> Self {
        Self::Transport(BridgeError::Transport(std::io::Error::other(format!(
            "session task failed: {error}"
        ))))
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shutdown requested"),
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::PeerSilent { idle } => write!(f, "peer silent for {idle:?}"),
            Self::Transport(error) => write!(f, "transport failure: {error}"),
            Self::Protocol(error) => write!(f, "protocol violation: {error}"),
        }
    }
}

/// A device session being brought up.
pub struct Session<T> {
    state: SessionState,
    framed: Framed<T, FrameCodec>,
    pending: Arc<PendingTable>,
    links: Vec<BridgeLink>,
    config: SessionConfig,
}

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("links", &self.links)
            .finish_non_exhaustive()
    }
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established transport.
    #[must_use]
    pub fn new(config: SessionConfig, io: T) -> Self {
        let mut session = Self {
            state: SessionState::Disconnected,
            framed: Framed::new(io, FrameCodec::default()),
            pending: Arc::new(PendingTable::default()),
            links: config.links(),
            config,
        };
        session.transition(SessionState::Connecting);
        session
    }

    /// Current bring-up state.
    #[must_use]
    pub fn state(&self) -> SessionState { self.state }

    /// Configured bridge links and whether each is bound.
    #[must_use]
    pub fn links(&self) -> &[BridgeLink] { &self.links }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {} -> {next}",
            self.state
        );
        info!(from = %self.state, to = %next, "session state");
        self.state = next;
    }

    /// Log in and bind every bridge link.
    ///
    /// On failure the session is [`SessionState::Closed`] and can only be
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AuthFailure`] or [`BridgeError::Timeout`] if
    /// login fails, and [`BridgeError::BindFailure`] for the first link that
    /// cannot be bound.
    pub async fn establish(&mut self) -> Result<()> {
        if self.state != SessionState::Connecting {
            return Err(BridgeError::SessionClosed);
        }
        self.transition(SessionState::Authenticating);
        let mut handshake =
            Handshake::new(&mut self.framed, &self.pending, self.config.response_timeout);
        if let Err(error) = handshake.login(&self.config.token).await {
            self.transition(SessionState::Closed);
            return Err(error);
        }
        self.transition(SessionState::Authenticated);

        let links = std::mem::take(&mut self.links);
        let mut handshake =
            Handshake::new(&mut self.framed, &self.pending, self.config.response_timeout);
        match handshake.bind_links(links).await {
            Ok(bound) => {
                self.links = bound;
                Ok(())
            }
            Err(error) => {
                self.links = self.config.links();
                self.transition(SessionState::Closed);
                Err(error)
            }
        }
    }

    /// Start the concurrent phase.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SessionClosed`] unless the session is
    /// authenticated.
    pub fn start(self, bus: Arc<dyn MessageBus>) -> Result<SessionHandle> {
        if self.state != SessionState::Authenticated {
            return Err(BridgeError::SessionClosed);
        }
        let Self {
            framed,
            pending,
            links,
            config,
            ..
        } = self;

        let FramedParts {
            io,
            read_buf,
            write_buf,
            ..
        } = framed.into_parts();
        debug_assert!(write_buf.is_empty(), "handshake frames are flushed");
        let (read_half, write_half) = tokio::io::split(io);

        let mapping = Arc::new(config.mapping);
        let pins = Arc::new(PinCache::new());
        let liveness = Arc::new(Liveness::new());
        let (sink, writer) = frame_channel(config.queue_capacity, config.max_send_rate);

        let dispatcher = CommandDispatcher::new(
            Arc::clone(&mapping),
            Arc::clone(&pins),
            bus,
            sink.clone(),
            Arc::clone(&pending),
        );
        let mut frames = FramedRead::new(read_half, FrameCodec::default());
        frames.read_buffer_mut().extend_from_slice(&read_buf);
        let reader = ConnectionReader::new(
            frames,
            Arc::clone(&pending),
            sink.clone(),
            dispatcher,
            Arc::clone(&liveness),
        );
        let heartbeat = HeartbeatKeeper::new(
            sink.clone(),
            Arc::clone(&pending),
            config.heartbeat_period,
            liveness,
            config.max_missed_heartbeats,
        );
        let forwarder = BridgeForwarder::new(
            links.into(),
            Arc::clone(&pending),
            sink.clone(),
            config.response_timeout,
        );
        let router = TopicRouter::new(mapping, Arc::clone(&pins), sink, Arc::clone(&pending), forwarder);

        let tokens = Tokens::default();
        let tasks = Tasks {
            reader: tokio::spawn(reader.run(tokens.reader.clone())),
            writer: tokio::spawn(writer.run(write_half, tokens.writer.clone())),
            heartbeat: tokio::spawn(heartbeat.run(tokens.heartbeat.clone())),
        };
        let shutdown = CancellationToken::new();
        #[cfg(feature = "metrics")]
        crate::metrics::inc_sessions();
        info!("session started");
        let supervisor = tokio::spawn(supervise(tasks, tokens, pending, shutdown.clone()));

        Ok(SessionHandle {
            router,
            pins,
            shutdown,
            supervisor,
        })
    }
}

/// How long teardown lets the reader finish a frame it is handling.
const READER_GRACE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Tokens {
    reader: CancellationToken,
    writer: CancellationToken,
    heartbeat: CancellationToken,
}

struct Tasks {
    reader: JoinHandle<std::result::Result<ReaderExit, CodecError>>,
    writer: JoinHandle<std::result::Result<(), CodecError>>,
    heartbeat: JoinHandle<HeartbeatStop>,
}

enum FirstStop {
    Requested,
    Reader(std::result::Result<std::result::Result<ReaderExit, CodecError>, tokio::task::JoinError>),
    Writer(std::result::Result<std::result::Result<(), CodecError>, tokio::task::JoinError>),
    Heartbeat(std::result::Result<HeartbeatStop, tokio::task::JoinError>),
}

async fn supervise(
    mut tasks: Tasks,
    tokens: Tokens,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
) -> SessionEnd {
    let first = tokio::select! {
        () = shutdown.cancelled() => FirstStop::Requested,
        exit = &mut tasks.reader => FirstStop::Reader(exit),
        exit = &mut tasks.writer => FirstStop::Writer(exit),
        stop = &mut tasks.heartbeat => FirstStop::Heartbeat(stop),
    };

    tokens.heartbeat.cancel();
    if !matches!(first, FirstStop::Heartbeat(_)) {
        let _ = tasks.heartbeat.await;
    }
    pending.fail_all();
    tokens.writer.cancel();
    let writer_result = match first {
        FirstStop::Writer(_) => None,
        _ => Some(tasks.writer.await),
    };
    tokens.reader.cancel();
    if !matches!(first, FirstStop::Reader(_))
        && tokio::time::timeout(READER_GRACE, &mut tasks.reader).await.is_err()
    {
        tasks.reader.abort();
    }

    let end = match first {
        FirstStop::Requested | FirstStop::Heartbeat(Ok(HeartbeatStop::Stopped)) => {
            SessionEnd::Shutdown
        }
        FirstStop::Reader(Ok(Ok(ReaderExit::PeerClosed))) => SessionEnd::PeerClosed,
        FirstStop::Reader(Ok(Ok(ReaderExit::Cancelled))) | FirstStop::Writer(Ok(Ok(()))) => {
            SessionEnd::Transport(BridgeError::SessionClosed)
        }
        FirstStop::Reader(Ok(Err(error))) | FirstStop::Writer(Ok(Err(error))) => {
            SessionEnd::from_codec(error)
        }
        FirstStop::Heartbeat(Ok(HeartbeatStop::PeerSilent { idle })) => {
            SessionEnd::PeerSilent { idle }
        }
        FirstStop::Heartbeat(Ok(HeartbeatStop::WriterClosed)) => match writer_result {
            Some(Ok(Err(error))) => SessionEnd::from_codec(error),
            _ => SessionEnd::Transport(BridgeError::SessionClosed),
        },
        FirstStop::Reader(Err(error)) => SessionEnd::from_join(&error),
        FirstStop::Writer(Err(error)) => SessionEnd::from_join(&error),
        FirstStop::Heartbeat(Err(error)) => SessionEnd::from_join(&error),
    };

    #[cfg(feature = "metrics")]
    {
        crate::metrics::dec_sessions();
        match &end {
            SessionEnd::Transport(_) => crate::metrics::inc_errors("transport"),
            SessionEnd::Protocol(error) => crate::metrics::inc_errors(error.error_type()),
            SessionEnd::PeerSilent { .. } => crate::metrics::inc_errors("silent"),
            SessionEnd::Shutdown | SessionEnd::PeerClosed => {}
        }
    }
    match &end {
        SessionEnd::Shutdown => info!(%end, "session ended"),
        SessionEnd::PeerClosed | SessionEnd::PeerSilent { .. } => warn!(%end, "session ended"),
        SessionEnd::Transport(_) | SessionEnd::Protocol(_) => error!(%end, "session ended"),
    }
    end
}

/// Control surface of a started session.
#[derive(Debug)]
pub struct SessionHandle {
    router: TopicRouter,
    pins: Arc<PinCache>,
    shutdown: CancellationToken,
    supervisor: JoinHandle<SessionEnd>,
}

impl SessionHandle {
    /// Router feeding bus messages into this session.
    #[must_use]
    pub fn router(&self) -> TopicRouter { self.router.clone() }

    /// Pin values seen so far.
    #[must_use]
    pub fn pins(&self) -> &Arc<PinCache> { &self.pins }

    /// Token that ends the session when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    /// Request an orderly shutdown.
    pub fn shutdown(&self) { self.shutdown.cancel(); }

    /// Wait for the session to end.
    pub async fn closed(self) -> SessionEnd {
        match self.supervisor.await {
            Ok(end) => end,
            Err(error) => SessionEnd::from_join(&error),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(SessionState::Disconnected, SessionState::Connecting, true)]
    #[case(SessionState::Connecting, SessionState::Authenticating, true)]
    #[case(SessionState::Authenticating, SessionState::Authenticated, true)]
    #[case(SessionState::Authenticating, SessionState::Closed, true)]
    #[case(SessionState::Authenticated, SessionState::Closed, true)]
    #[case(SessionState::Connecting, SessionState::Authenticated, false)]
    #[case(SessionState::Closed, SessionState::Authenticated, false)]
    #[case(SessionState::Closed, SessionState::Closed, false)]
    #[case(SessionState::Authenticated, SessionState::Authenticating, false)]
    fn transitions_are_sequential(
        #[case] from: SessionState,
        #[case] to: SessionState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn codec_errors_split_into_transport_and_protocol() {
        let io = SessionEnd::from_codec(CodecError::Io(std::io::Error::other("reset")));
        assert!(matches!(io, SessionEnd::Transport(BridgeError::Transport(_))));
        let protocol = SessionEnd::from_codec(CodecError::Protocol(
            crate::codec::ProtocolError::UnknownMessageType { type_id: 9 },
        ));
        assert!(matches!(protocol, SessionEnd::Protocol(_)));
    }
}
