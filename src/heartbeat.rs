//! Periodic keepalive and optional peer liveness tracking.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{correlation::PendingTable, frame::Frame, writer::FrameSink};

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

/// Time of the most recent inbound frame.
#[derive(Debug)]
pub struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Default for Liveness {
    fn default() -> Self { Self::new() }
}

impl Liveness {
    /// Start tracking from now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Record that the peer sent something.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the peer last sent anything.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Why the heartbeat keeper stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatStop {
    /// Cancelled by teardown.
    Stopped,
    /// No inbound frame for the configured number of periods.
    PeerSilent {
        /// How long the peer had been quiet.
        idle: Duration,
    },
    /// The write path is gone.
    WriterClosed,
}

/// Emits fire-and-forget `PING` frames at a fixed period.
#[derive(Debug)]
pub struct HeartbeatKeeper {
    sink: FrameSink,
    pending: Arc<PendingTable>,
    period: Duration,
    liveness: Arc<Liveness>,
    max_missed: Option<u32>,
}

impl HeartbeatKeeper {
    /// Create a keeper that pings every `period`.
    ///
    /// When `max_missed` is set the keeper also ends the session once the
    /// peer has been silent for that many periods.
    #[must_use]
    pub fn new(
        sink: FrameSink,
        pending: Arc<PendingTable>,
        period: Duration,
        liveness: Arc<Liveness>,
        max_missed: Option<u32>,
    ) -> Self {
        Self {
            sink,
            pending,
            period,
            liveness,
            max_missed,
        }
    }

    fn silence_limit(&self) -> Option<Duration> {
        self.max_missed
            .filter(|missed| *missed > 0)
            .map(|missed| self.period.saturating_mul(missed))
    }

    /// Ping until cancelled, the writer closes or the peer falls silent.
    pub async fn run(self, shutdown: CancellationToken) -> HeartbeatStop {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let silence_limit = self.silence_limit();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return HeartbeatStop::Stopped,
                _ = ticker.tick() => {}
            }

            if let Some(limit) = silence_limit {
                let idle = self.liveness.idle();
                if idle >= limit {
                    warn!(idle_secs = idle.as_secs(), "peer silent; ending session");
                    return HeartbeatStop::PeerSilent { idle };
                }
            }

            let id = self.pending.allocate_id();
            debug!(id, "heartbeat");
            if self.sink.submit(Frame::ping(id)).await.is_err() {
                return HeartbeatStop::WriterClosed;
            }
        }
    }
}
