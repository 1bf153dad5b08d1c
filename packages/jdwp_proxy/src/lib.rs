//! JDWP Proxy - one shared debugger endpoint for many cooperating processes
//!
//! Every tool process that wants to offer the endpoint creates a [`ProxyServer`]
//! and calls `start`. Whoever binds the port first leads and serves clients; the
//! rest follow by holding a connection to the leader, and race to bind the port
//! once that connection breaks. The operating system's exclusive bind is the
//! only arbitration.
//!
//! # Example
//!
//! ```no_run
//! use jdwp_proxy::{JdwpProxyFactory, ListenEndpoint, ProxyServer};
//!
//! let factory = JdwpProxyFactory::new();
//! let directory = factory.directory();
//!
//! let mut server = ProxyServer::new(ListenEndpoint::loopback(8599), factory)
//!     .with_state_listener(move || directory.publish_clients());
//! server.start().unwrap();
//!
//! println!("running as {:?}", server.role());
//! server.stop();
//! ```

mod client_manager;
pub mod config;
mod error;
mod handler;
pub mod jdwp;
mod server;

pub use client_manager::ClientManagerRegistry;
pub use config::ProxyConfig;
pub use error::{ConnectionError, ProxyError};
pub use handler::{ConnectionHandler, ConnectionHandlerFactory, ConnectionId};
pub use jdwp::{JdwpPacket, JdwpProxyFactory, JdwpProxyHandler, JdwpSession, SessionDirectory};
pub use server::{
    DEFAULT_RECONNECT_INTERVAL, ListenEndpoint, ProxyServer, ProxyServerStateChanged, Role,
};
