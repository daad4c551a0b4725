//! # Transport Error Taxonomy
//!
//! Every transport (`ncacn_np`, `ncalrpc`, `ncacn_ip_tcp`, `ncacn_http`) reports
//! failures through this single enum so that binding/association code above the
//! transport layer can match on failure *kind* without knowing which protocol
//! sequence produced it.
//!
//! ## Propagation Policy
//!
//! Only two situations are retried internally: a busy local pipe (once) and an
//! HTTP authentication leg (until the scheme reports completion). Every other
//! error here propagates to the caller unchanged.

use thiserror::Error;

/// Error kinds produced by the transport layer.
///
/// These map one-to-one onto the abstract kinds in the transport
/// specification; the outer RPC runtime is free to assign concrete status
/// codes when surfacing these to callers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transport could not reach the peer.
    #[error("server unavailable at {endpoint}: {source}")]
    ServerUnavailable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Peer was reachable but refused (pipe busy beyond retry).
    #[error("server too busy at {endpoint}")]
    ServerTooBusy { endpoint: String },

    /// Bind/create failed for local reasons.
    #[error("can't create endpoint {endpoint}: {source}")]
    CantCreateEndpoint {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Endpoint name already in use.
    #[error("endpoint {endpoint} already exists")]
    DuplicateEndpoint { endpoint: String },

    /// Endpoint string did not parse.
    #[error("invalid endpoint format: {endpoint:?}")]
    InvalidEndpointFormat { endpoint: String },

    /// Unknown protocol sequence name.
    #[error("protocol sequence not supported: {name}")]
    ProtseqNotSupported { name: String },

    /// Tower bytes do not match the expected floors for this transport.
    #[error("tower floors do not match this transport")]
    NotRegistered,

    /// Wire-format violation mid-session.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Cancel event fired during a blocking wait.
    #[error("call cancelled")]
    CallCancelled,

    /// Allocation/handle exhaustion.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Security impersonation refused.
    #[error("no impersonation context available")]
    NoContextAvailable,

    /// Authentication rejected by the server.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Recognized but intentionally undriven authentication scheme
    /// (Digest, Passport) or a server-side `ncacn_http` listener.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Catch-all for I/O failures that don't need their own variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
