//! # DCE/MSRPC Transport Layer
//!
//! Abstracts `ncacn_np`, `ncalrpc`, `ncacn_ip_tcp` and `ncacn_http` protocol
//! sequences behind one connection contract ([`connection::Connection`]), so
//! the rest of an RPC runtime can open, read, write and tear down a call
//! without caring which wire transport carries it.
//!
//! [`registry::TransportRegistry`] is the entry point: it resolves a
//! protocol sequence name to the right connection/listener constructor.
//! [`listener::Acceptor`] multiplexes accepted connections from however many
//! protocol sequences a server registers into one channel.

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod logging;
pub mod registry;
pub mod tower;

pub use connection::{AnyConnection, Connection, ConnectionHandle, ProtocolSequence};
pub use error::{Result, TransportError};
pub use listener::{Acceptor, ProtseqListener};
pub use registry::{is_server_listening, TransportRegistry};

/// The current version of this transport library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values, mirroring the constants the teacher keeps
/// alongside its benchmark defaults.
pub mod defaults {
    /// Default maximum transmission fragment size, per spec §4.1
    /// (`RPC_C_MAX_REQUESTED_PKT_SIZE`'s de facto baseline).
    pub const MAX_TRANSMISSION_SIZE: usize = 5840;

    /// Default accept backlog for a registered listener.
    pub const MAX_CALLS: usize = 64;
}
