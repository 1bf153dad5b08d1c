//! Debugger stream proxy: many debugger connections sharing one target process.
//!
//! A connection opens with a hex4-framed `jdwp:<pid>` request, answered with
//! `OKAY`. Both sides then exchange the `JDWP-Handshake` token, after which JDWP
//! packets from any debugger attached to a pid are relayed to every other
//! debugger attached to the same pid.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use state_hub::ClientStateChangeHub;
use state_hub::wire::{self, JDWP_HANDSHAKE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::client_manager::ClientManagerRegistry;
use crate::config::ProxyConfig;
use crate::error::ConnectionError;
use crate::handler::{ConnectionHandler, ConnectionHandlerFactory};

/// length(4) + id(4) + flags(1) + command set/command or error code(2)
pub const JDWP_HEADER_LEN: usize = 11;

/// Upper bound on a single relayed packet
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

const REPLY_FLAG: u8 = 0x80;
const REQUEST_PREFIX: &str = "jdwp:";

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// One complete JDWP packet, header included
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JdwpPacket {
    bytes: Vec<u8>,
}

impl JdwpPacket {
    /// Build a command packet.
    pub fn command(id: u32, command_set: u8, command: u8, data: &[u8]) -> Self {
        Self::assemble(id, 0, [command_set, command], data)
    }

    /// Build a reply packet.
    pub fn reply(id: u32, error_code: u16, data: &[u8]) -> Self {
        Self::assemble(id, REPLY_FLAG, error_code.to_be_bytes(), data)
    }

    fn assemble(id: u32, flags: u8, tail: [u8; 2], data: &[u8]) -> Self {
        let len = (JDWP_HEADER_LEN + data.len()) as u32;
        let mut bytes = Vec::with_capacity(JDWP_HEADER_LEN + data.len());
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&id.to_be_bytes());
        bytes.push(flags);
        bytes.extend_from_slice(&tail);
        bytes.extend_from_slice(data);
        Self { bytes }
    }

    pub fn id(&self) -> u32 {
        u32::from_be_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }

    pub fn is_reply(&self) -> bool {
        self.bytes[8] & REPLY_FLAG != 0
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[JDWP_HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Take one complete packet off the front of `buf`, if there is one.
pub fn decode_packet(buf: &mut Vec<u8>) -> Result<Option<JdwpPacket>, ConnectionError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < JDWP_HEADER_LEN {
        return Err(ConnectionError::Protocol(format!(
            "packet length {} is shorter than the header",
            len
        )));
    }
    if len > MAX_PACKET_LEN {
        return Err(ConnectionError::Protocol(format!(
            "packet length {} exceeds limit",
            len
        )));
    }
    if buf.len() < len {
        return Ok(None);
    }
    let bytes: Vec<u8> = buf.drain(..len).collect();
    Ok(Some(JdwpPacket { bytes }))
}

/// Parse a `jdwp:<pid>` request into its routing key.
pub fn parse_request(request: &[u8]) -> Result<u32, String> {
    let request = std::str::from_utf8(request).map_err(|_| "request is not ASCII".to_string())?;
    let pid = request
        .strip_prefix(REQUEST_PREFIX)
        .ok_or_else(|| format!("unknown request: {}", request))?;
    pid.parse::<u32>()
        .map_err(|_| format!("invalid pid: {}", pid))
}

/// State shared by every debugger attached to one process
pub struct JdwpSession {
    pid: u32,
    debuggers: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<JdwpPacket>>>,
}

impl JdwpSession {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            debuggers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, mpsc::UnboundedSender<JdwpPacket>>> {
        self.debuggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn debugger_count(&self) -> usize {
        self.lock().len()
    }

    fn attach(&self, peer: SocketAddr) -> mpsc::UnboundedReceiver<JdwpPacket> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().insert(peer, sender);
        receiver
    }

    fn detach(&self, peer: SocketAddr) {
        self.lock().remove(&peer);
    }

    /// Forward `packet` to every attached debugger except `from`.
    /// Returns how many debuggers it reached.
    pub fn relay(&self, from: SocketAddr, packet: &JdwpPacket) -> usize {
        let mut debuggers = self.lock();
        debuggers.retain(|peer, sender| *peer == from || sender.send(packet.clone()).is_ok());
        debuggers.len().saturating_sub(1)
    }
}

/// Sessions by pid, plus the hub told whenever the set of attached pids changes
#[derive(Default)]
pub struct SessionDirectory {
    sessions: ClientManagerRegistry<u32, JdwpSession>,
    client_hub: RwLock<Option<Arc<ClientStateChangeHub>>>,
}

impl SessionDirectory {
    fn set_client_hub(&self, hub: Arc<ClientStateChangeHub>) {
        *self.client_hub.write().unwrap_or_else(PoisonError::into_inner) = Some(hub);
    }

    fn open(&self, pid: u32) -> Arc<JdwpSession> {
        self.sessions.get_or_create(&pid, || JdwpSession::new(pid))
    }

    pub fn session(&self, pid: u32) -> Option<Arc<JdwpSession>> {
        self.sessions.get(&pid)
    }

    /// Pids with at least one attached debugger, ascending.
    pub fn attached_pids(&self) -> Vec<u32> {
        let mut pids = self.sessions.live_keys();
        pids.sort_unstable();
        pids
    }

    /// Publish the current pid list to client trackers.
    pub fn publish_clients(&self) {
        let hub = self
            .client_hub
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hub) = hub {
            hub.client_list_changed(&self.attached_pids());
        }
    }
}

/// Creates a [`JdwpProxyHandler`] per accepted debugger connection
pub struct JdwpProxyFactory {
    directory: Arc<SessionDirectory>,
    handshake_timeout: Duration,
    read_buffer_size: usize,
}

impl Default for JdwpProxyFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl JdwpProxyFactory {
    pub fn new() -> Self {
        Self {
            directory: Arc::new(SessionDirectory::default()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new()
            .with_handshake_timeout(config.handshake_timeout)
            .with_read_buffer_size(config.read_buffer_size)
    }

    /// Report attached pids to `hub`. Directory handles taken earlier see it too.
    pub fn with_client_hub(self, hub: Arc<ClientStateChangeHub>) -> Self {
        self.directory.set_client_hub(hub);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(JDWP_HEADER_LEN);
        self
    }

    pub fn directory(&self) -> Arc<SessionDirectory> {
        self.directory.clone()
    }
}

impl ConnectionHandlerFactory for JdwpProxyFactory {
    type Handler = JdwpProxyHandler;

    fn create(&self, stream: TcpStream, peer: SocketAddr) -> JdwpProxyHandler {
        JdwpProxyHandler {
            stream,
            peer,
            directory: self.directory.clone(),
            buf: Vec::with_capacity(self.read_buffer_size),
            read_chunk: self.read_buffer_size,
            handshake_deadline: Instant::now() + self.handshake_timeout,
            phase: Phase::Request,
            attachment: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Request,
    Handshake { pid: u32 },
    Relay,
    /// A follower watching this leader; only its EOF matters.
    Watch,
    Closed,
}

impl Phase {
    fn describe(&self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Handshake { .. } => "handshake",
            Phase::Relay => "packets",
            Phase::Watch | Phase::Closed => "nothing",
        }
    }
}

struct Attachment {
    session: Arc<JdwpSession>,
    outbound: mpsc::UnboundedReceiver<JdwpPacket>,
}

enum Event {
    Read(usize),
    Outbound(JdwpPacket),
}

/// Incremental request/handshake/packet parser for one debugger connection
pub struct JdwpProxyHandler {
    stream: TcpStream,
    peer: SocketAddr,
    directory: Arc<SessionDirectory>,
    buf: Vec<u8>,
    read_chunk: usize,
    handshake_deadline: Instant,
    phase: Phase,
    attachment: Option<Attachment>,
}

impl JdwpProxyHandler {
    async fn next_event(&mut self) -> Result<Event, ConnectionError> {
        self.buf.reserve(self.read_chunk);

        match (self.phase, self.attachment.as_mut()) {
            (Phase::Relay, Some(attachment)) => {
                tokio::select! {
                    read = self.stream.read_buf(&mut self.buf) => Ok(Event::Read(read?)),
                    Some(packet) = attachment.outbound.recv() => Ok(Event::Outbound(packet)),
                }
            }
            (Phase::Watch, _) => Ok(Event::Read(self.stream.read_buf(&mut self.buf).await?)),
            (phase, _) => {
                let read =
                    tokio::time::timeout_at(self.handshake_deadline, self.stream.read_buf(&mut self.buf))
                        .await
                        .map_err(|_| ConnectionError::Timeout(phase.describe()))?;
                Ok(Event::Read(read?))
            }
        }
    }

    /// Consume as much of the buffer as the current phase allows.
    async fn process_buffer(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.phase {
                Phase::Request => {
                    let Some(request) = wire::decode_hex4(&mut self.buf)? else {
                        return Ok(());
                    };
                    if request == wire::FOLLOW_REQUEST {
                        debug!("{} is following this leader", self.peer);
                        self.phase = Phase::Watch;
                        continue;
                    }
                    match parse_request(&request) {
                        Ok(pid) => {
                            self.stream.write_all(wire::OKAY).await?;
                            self.phase = Phase::Handshake { pid };
                        }
                        Err(reason) => {
                            let reply = wire::encode_fail(&reason)?;
                            self.stream.write_all(&reply).await?;
                            return Err(ConnectionError::Protocol(reason));
                        }
                    }
                }
                Phase::Handshake { pid } => {
                    if self.buf.len() < JDWP_HANDSHAKE.len() {
                        return Ok(());
                    }
                    if self.buf[..JDWP_HANDSHAKE.len()] != JDWP_HANDSHAKE[..] {
                        return Err(ConnectionError::Protocol("bad handshake".to_string()));
                    }
                    self.buf.drain(..JDWP_HANDSHAKE.len());
                    self.attach(pid);
                    self.stream.write_all(JDWP_HANDSHAKE).await?;
                    self.phase = Phase::Relay;
                }
                Phase::Relay => {
                    let Some(packet) = decode_packet(&mut self.buf)? else {
                        return Ok(());
                    };
                    if let Some(attachment) = &self.attachment {
                        let reached = attachment.session.relay(self.peer, &packet);
                        trace!(
                            "Relayed packet {} from {} to {} debugger(s)",
                            packet.id(),
                            self.peer,
                            reached
                        );
                    }
                }
                Phase::Watch => {
                    self.buf.clear();
                    return Ok(());
                }
                Phase::Closed => return Err(ConnectionError::Closed),
            }
        }
    }

    fn attach(&mut self, pid: u32) {
        let session = self.directory.open(pid);
        let outbound = session.attach(self.peer);
        debug!(
            "{} attached to pid {} ({} debugger(s))",
            self.peer,
            pid,
            session.debugger_count()
        );
        self.attachment = Some(Attachment { session, outbound });
        self.directory.publish_clients();
    }
}

impl ConnectionHandler for JdwpProxyHandler {
    async fn read(&mut self) -> Result<(), ConnectionError> {
        if self.phase == Phase::Closed {
            return Err(ConnectionError::Closed);
        }
        match self.next_event().await? {
            Event::Read(0) => Err(ConnectionError::Closed),
            Event::Read(_) => self.process_buffer().await,
            Event::Outbound(packet) => {
                self.stream.write_all(packet.as_bytes()).await?;
                Ok(())
            }
        }
    }

    fn shutdown(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;
        self.buf.clear();

        if let Some(attachment) = self.attachment.take() {
            let pid = attachment.session.pid();
            attachment.session.detach(self.peer);
            drop(attachment);
            debug!("{} detached from pid {}", self.peer, pid);
            self.directory.publish_clients();
        }
    }
}
