use std::io;
use std::net::SocketAddr;

/// Errors surfaced synchronously by [`ProxyServer::start`](crate::ProxyServer::start)
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Binding failed for a reason other than another process owning the endpoint
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn proxy worker thread")]
    Spawn(#[source] io::Error),

    #[error("proxy server is already running")]
    AlreadyRunning,
}

/// Why a connection handler gave up on its socket
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed by peer")]
    Closed,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Wire(#[from] state_hub::WireError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
