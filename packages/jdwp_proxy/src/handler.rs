use std::fmt;
use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::error::ConnectionError;

/// Identifier the server assigns to each accepted connection
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-socket protocol state, driven by the proxy's worker thread.
///
/// Handlers run as local tasks on that single thread, so they need not be
/// `Send`, but `read` must only await I/O readiness and never block the thread.
pub trait ConnectionHandler {
    /// Service the socket once: consume whatever arrived and react to it.
    ///
    /// Any error makes the server call [`shutdown`](Self::shutdown) and drop
    /// the handler; [`ConnectionError::Closed`] is the normal end of a peer.
    fn read(&mut self) -> impl Future<Output = Result<(), ConnectionError>>;

    /// Release everything the handler holds. Must tolerate repeated calls.
    fn shutdown(&mut self);
}

/// Builds one handler per accepted socket.
pub trait ConnectionHandlerFactory: Send + Sync + 'static {
    type Handler: ConnectionHandler + 'static;

    fn create(&self, stream: TcpStream, peer: SocketAddr) -> Self::Handler;
}
