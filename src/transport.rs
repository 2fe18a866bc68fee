//! Device connection setup and socket tuning.

use std::{fmt, io, net::SocketAddr, time::Duration};

use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tracing::{debug, info};

/// Host and port of the device protocol server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerAddress {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddress {
    /// Build an address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Socket options applied before connecting to the server.
///
/// ```
/// use pinbridge::transport::SocketOptions;
///
/// let options = SocketOptions::default().nodelay(true).send_buffer_size(8192);
/// assert_eq!(options, SocketOptions::default().send_buffer_size(8192).nodelay(true));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    nodelay: Option<bool>,
    send_buffer_size: Option<u32>,
    recv_buffer_size: Option<u32>,
}

impl SocketOptions {
    /// Configure `TCP_NODELAY` behaviour on the socket.
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = Some(enabled);
        self
    }

    /// Configure the socket send buffer size.
    #[must_use]
    pub fn send_buffer_size(mut self, size: u32) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Configure the socket receive buffer size.
    #[must_use]
    pub fn recv_buffer_size(mut self, size: u32) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    pub(crate) fn apply(&self, socket: &TcpSocket) -> io::Result<()> {
        if let Some(enabled) = self.nodelay {
            socket.set_nodelay(enabled)?;
        }
        if let Some(size) = self.send_buffer_size {
            let old = socket.send_buffer_size()?;
            socket.set_send_buffer_size(size)?;
            info!(old, new = socket.send_buffer_size()?, "SO_SNDBUF updated");
        }
        if let Some(size) = self.recv_buffer_size {
            let old = socket.recv_buffer_size()?;
            socket.set_recv_buffer_size(size)?;
            info!(old, new = socket.recv_buffer_size()?, "SO_RCVBUF updated");
        }
        Ok(())
    }
}

/// Open a tuned TCP connection to `server` within `timeout`.
///
/// Every resolved address is tried in turn.
///
/// # Errors
///
/// Returns the last connection error, or [`io::ErrorKind::TimedOut`] if the
/// whole attempt exceeded `timeout`.
pub async fn connect(
    server: &ServerAddress,
    options: SocketOptions,
    timeout: Duration,
) -> io::Result<TcpStream> {
    tokio::time::timeout(timeout, connect_any(server, options))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {server}")))?
}

async fn connect_any(server: &ServerAddress, options: SocketOptions) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in lookup_host((server.host.as_str(), server.port)).await? {
        match connect_addr(addr, options).await {
            Ok(stream) => {
                info!(%addr, "connected to device server");
                return Ok(stream);
            }
            Err(error) => {
                debug!(%addr, %error, "connect attempt failed");
                last_error = Some(error);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{server} did not resolve"))
    }))
}

async fn connect_addr(addr: SocketAddr, options: SocketOptions) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    options.apply(&socket)?;
    socket.connect(addr).await
}
