use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use state_hub::wire;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet, LocalSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ConnectionError, ProxyError};
use crate::handler::{ConnectionHandler, ConnectionHandlerFactory, ConnectionId};

/// Minimum spacing between two attempts to reach the leader
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion) cannot spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Which side of the endpoint arbitration this instance is on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Owns the listening endpoint and serves clients
    Leading,
    /// Watches the current leader, ready to take over when it dies
    Following,
}

/// Address every cooperating instance tries to own
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ListenEndpoint {
    host: IpAddr,
    port: u16,
}

impl ListenEndpoint {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    pub fn loopback(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// Observer fired on the worker thread each time a follower becomes leader.
///
/// Dependents use it to throw away state cached from the previous leader. It
/// runs on the I/O thread, so it must return quickly. It should not call
/// [`ProxyServer::stop`]; if it does, the worker is cancelled but cannot join
/// itself and winds down after the callback returns.
pub trait ProxyServerStateChanged: Send + Sync {
    fn changed(&self);
}

impl<F> ProxyServerStateChanged for F
where
    F: Fn() + Send + Sync,
{
    fn changed(&self) {
        self()
    }
}

const ROLE_NONE: u8 = 0;
const ROLE_LEADING: u8 = 1;
const ROLE_FOLLOWING: u8 = 2;

/// Snapshot of worker state readable from any thread
#[derive(Default)]
struct Shared {
    role: AtomicU8,
    connections: AtomicUsize,
}

impl Shared {
    fn set_role(&self, role: Option<Role>) {
        let raw = match role {
            None => ROLE_NONE,
            Some(Role::Leading) => ROLE_LEADING,
            Some(Role::Following) => ROLE_FOLLOWING,
        };
        self.role.store(raw, Ordering::SeqCst);
    }

    fn role(&self) -> Option<Role> {
        match self.role.load(Ordering::SeqCst) {
            ROLE_LEADING => Some(Role::Leading),
            ROLE_FOLLOWING => Some(Role::Following),
            _ => None,
        }
    }
}

struct WorkerHandle {
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

/// One instance of the shared proxy endpoint.
///
/// `start` either binds the endpoint and serves it (leading) or, if another
/// process already owns it, watches that process and takes over when it goes
/// away (following). All socket work happens on one dedicated worker thread.
pub struct ProxyServer<F: ConnectionHandlerFactory> {
    endpoint: ListenEndpoint,
    factory: Arc<F>,
    reconnect_interval: Duration,
    state_listener: Option<Arc<dyn ProxyServerStateChanged>>,
    shared: Arc<Shared>,
    worker: Option<WorkerHandle>,
}

impl<F: ConnectionHandlerFactory> ProxyServer<F> {
    pub fn new(endpoint: ListenEndpoint, factory: F) -> Self {
        Self {
            endpoint,
            factory: Arc::new(factory),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            state_listener: None,
            shared: Arc::new(Shared::default()),
            worker: None,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_state_listener(mut self, listener: impl ProxyServerStateChanged + 'static) -> Self {
        self.state_listener = Some(Arc::new(listener));
        self
    }

    /// Claim the endpoint or start following its owner.
    ///
    /// Only a bind failure other than "address in use" is an error; losing the
    /// bind race just means this instance follows.
    pub fn start(&mut self) -> Result<(), ProxyError> {
        if self.is_running() {
            return Err(ProxyError::AlreadyRunning);
        }
        // Reap a worker that died on its own.
        self.stop();

        let addr = self.endpoint.socket_addr();
        let listener = match bind_listener(addr) {
            Ok(listener) => Some(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => None,
            Err(source) => return Err(ProxyError::Bind { addr, source }),
        };
        let role = if listener.is_some() {
            Role::Leading
        } else {
            Role::Following
        };
        self.shared.set_role(Some(role));
        self.shared.connections.store(0, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let worker = Worker {
            endpoint: self.endpoint,
            factory: self.factory.clone(),
            reconnect_interval: self.reconnect_interval,
            state_listener: self.state_listener.clone(),
            shared: self.shared.clone(),
            cancel: cancel.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("jdwp-proxy-{}", self.endpoint.port()))
            .spawn(move || worker.run(listener));

        match spawned {
            Ok(thread) => {
                info!("Proxy server on {} started as {:?}", self.endpoint, role);
                self.worker = Some(WorkerHandle { cancel, thread });
                Ok(())
            }
            Err(e) => {
                self.shared.set_role(None);
                Err(ProxyError::Spawn(e))
            }
        }
    }

    /// Tear everything down and join the worker. Safe to call repeatedly and
    /// from any thread that owns the server; `start` may be called again after.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        worker.cancel.cancel();
        if worker.thread.thread().id() == thread::current().id() {
            warn!("Proxy server on {} stopped from its own worker; not joining", self.endpoint);
        } else if worker.thread.join().is_err() {
            error!("Proxy worker for {} panicked", self.endpoint);
        }

        self.shared.set_role(None);
        self.shared.connections.store(0, Ordering::SeqCst);
        info!("Proxy server on {} stopped", self.endpoint);
    }

    /// Current role, or `None` when not running.
    pub fn role(&self) -> Option<Role> {
        self.shared.role()
    }

    pub fn is_leading(&self) -> bool {
        self.role() == Some(Role::Leading)
    }

    /// Whether the worker thread is alive. A worker that failed to set up its
    /// runtime counts as not running.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.thread.is_finished())
    }

    /// Number of client connections currently registered (leader only).
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> ListenEndpoint {
        self.endpoint
    }
}

impl<F: ConnectionHandlerFactory> Drop for ProxyServer<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<StdTcpListener> {
    let listener = StdTcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// How a watch on the leader ended
enum LeaderLink {
    Cancelled,
    Closed,
    Failed(io::Error),
}

/// Everything the worker thread owns
struct Worker<F: ConnectionHandlerFactory> {
    endpoint: ListenEndpoint,
    factory: Arc<F>,
    reconnect_interval: Duration,
    state_listener: Option<Arc<dyn ProxyServerStateChanged>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl<F: ConnectionHandlerFactory> Worker<F> {
    fn run(self, listener: Option<StdTcpListener>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to build runtime for proxy on {}: {}", self.endpoint, e);
                self.shared.set_role(None);
                return;
            }
        };

        let local = LocalSet::new();
        local.block_on(&runtime, self.serve(listener));
        debug!("Proxy worker for {} exiting", self.endpoint);
    }

    async fn serve(&self, listener: Option<StdTcpListener>) {
        let listener = match listener {
            Some(listener) => listener,
            None => match self.follow().await {
                Some(listener) => {
                    self.shared.set_role(Some(Role::Leading));
                    info!("Took over {} as leader", self.endpoint);
                    if let Some(state_listener) = &self.state_listener {
                        state_listener.changed();
                    }
                    listener
                }
                None => return,
            },
        };
        self.lead(listener).await;
    }

    /// Accept and dispatch until cancelled.
    async fn lead(&self, listener: StdTcpListener) {
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to register listener on {}: {}", self.endpoint, e);
                return;
            }
        };
        debug!("Leading on {}", self.endpoint);

        let mut connections = JoinSet::new();
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        let id = ConnectionId(next_id);
                        let handler = self.factory.create(stream, peer);
                        self.shared.connections.fetch_add(1, Ordering::SeqCst);
                        debug!("Registered {} from {}", id, peer);
                        connections.spawn_local(drive(id, handler, self.cancel.clone()));
                    }
                    Err(e) => {
                        warn!("Accept failed on {}: {}", self.endpoint, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = connections.join_next() => self.deregister(finished),
            }
        }

        // Close the endpoint first so a follower can claim it as soon as its link drops.
        drop(listener);
        while let Some(finished) = connections.join_next().await {
            self.deregister(finished);
        }
    }

    fn deregister(&self, finished: Result<ConnectionId, JoinError>) {
        self.shared.connections.fetch_sub(1, Ordering::SeqCst);
        match finished {
            Ok(id) => debug!("Deregistered {}", id),
            Err(e) => warn!("Connection task on {} failed: {}", self.endpoint, e),
        }
    }

    /// Watch the leader until it dies, then try to take its place.
    ///
    /// Returns the freshly bound listener, or `None` if cancelled.
    async fn follow(&self) -> Option<StdTcpListener> {
        let addr = self.endpoint.socket_addr();
        let mut last_attempt: Option<Instant> = None;

        loop {
            if let Some(at) = last_attempt {
                let wait = self.reconnect_interval.saturating_sub(at.elapsed());
                if !wait.is_zero() {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
            last_attempt = Some(Instant::now());

            match self.watch_leader(addr).await {
                LeaderLink::Cancelled => return None,
                LeaderLink::Closed => debug!("Leader on {} closed the link", self.endpoint),
                LeaderLink::Failed(e) => debug!("Leader link on {} failed: {}", self.endpoint, e),
            }

            // A follower being stopped must not grab the endpoint on its way out.
            if self.cancel.is_cancelled() {
                return None;
            }

            match bind_listener(addr) {
                Ok(listener) => return Some(listener),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    debug!("{} already claimed by another instance", self.endpoint);
                }
                Err(e) => warn!("Could not take over {}: {}", self.endpoint, e),
            }
        }
    }

    /// Hold a link to the leader open until it breaks.
    ///
    /// The link opens with a follow request so the leader leaves it alone. The
    /// read then only completes when the leader goes away. Stray bytes are
    /// ignored.
    async fn watch_leader(&self, addr: SocketAddr) -> LeaderLink {
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return LeaderLink::Cancelled,
            connected = TcpStream::connect(addr) => connected,
        };
        let mut link = match connected {
            Ok(link) => link,
            Err(e) => return LeaderLink::Failed(e),
        };
        let announce = match wire::encode_hex4(wire::FOLLOW_REQUEST) {
            Ok(frame) => link.write_all(&frame).await,
            Err(e) => Err(io::Error::other(e)),
        };
        if let Err(e) = announce {
            return LeaderLink::Failed(e);
        }
        debug!("Following leader on {}", self.endpoint);

        let mut scratch = [0u8; 64];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LeaderLink::Cancelled,
                read = link.read(&mut scratch) => match read {
                    Ok(0) => return LeaderLink::Closed,
                    Ok(n) => trace!("Ignoring {} byte(s) from leader", n),
                    Err(e) => return LeaderLink::Failed(e),
                },
            }
        }
    }
}

/// Run one handler until it fails, its peer leaves, or the server stops.
async fn drive<H: ConnectionHandler>(
    id: ConnectionId,
    mut handler: H,
    cancel: CancellationToken,
) -> ConnectionId {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = handler.read() => match result {
                Ok(()) => {}
                Err(ConnectionError::Closed) => {
                    debug!("{} closed by peer", id);
                    break;
                }
                Err(e) => {
                    debug!("{} dropped: {}", id, e);
                    break;
                }
            },
        }
    }
    handler.shutdown();
    id
}
