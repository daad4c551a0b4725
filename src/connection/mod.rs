//! # Connection Object
//!
//! The per-call byte channel with the uniform contract spec §4.2 requires:
//! open, read, write, close, cancel, close-read, impersonate, revert,
//! wait-for-data. One variant exists per transport (`pipe`, `tcp`, `http`);
//! [`AnyConnection`] is the tagged-variant re-expression the spec's Design
//! Notes (§9) call for in place of the original's function-pointer vtable.

pub mod http;
pub mod pipe;
pub mod tcp;

use crate::error::Result;
use crate::tower;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// The four protocol sequences this transport layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolSequence {
    NcacnNp,
    Ncalrpc,
    NcacnIpTcp,
    NcacnHttp,
}

impl ProtocolSequence {
    /// Case-sensitive lookup, per spec §4.1.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ncacn_np" => Some(Self::NcacnNp),
            "ncalrpc" => Some(Self::Ncalrpc),
            "ncacn_ip_tcp" => Some(Self::NcacnIpTcp),
            "ncacn_http" => Some(Self::NcacnHttp),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NcacnNp => "ncacn_np",
            Self::Ncalrpc => "ncalrpc",
            Self::NcacnIpTcp => "ncacn_ip_tcp",
            Self::NcacnHttp => "ncacn_http",
        }
    }
}

/// Result of `inquire_auth_client`: the authentication context the transport
/// itself vouches for, absent any higher-level negotiated scheme.
#[derive(Debug, Clone, Default)]
pub struct AuthClientInfo {
    pub privacy: bool,
    pub authn_service: &'static str,
}

/// The common capability set every connection variant implements.
///
/// Defaults mirror the "defaulted" behavior spec §4.2 assigns to transports
/// that don't need a real implementation (e.g. TCP's impersonation, HTTP's
/// secure_packet).
#[async_trait]
pub trait Connection: Send + Sync {
    fn protocol_sequence(&self) -> ProtocolSequence;
    fn is_server(&self) -> bool;
    fn network_addr(&self) -> Option<&str>;
    fn endpoint(&self) -> Option<&str>;
    fn max_transmission_size(&self) -> usize {
        5840
    }

    /// Idempotent when already open.
    async fn open(&self) -> Result<()>;

    /// Blocking read; returns bytes placed into `buf`. See spec §4.2 for the
    /// message-boundary behavior local pipes may exhibit.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Blocking write; writes exactly `buf.len()` bytes on success.
    async fn write(&self, buf: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Directed shutdown of the receive side only.
    async fn close_read(&self) -> Result<()>;

    /// Asynchronous, non-blocking signal to any in-flight read/write.
    fn cancel_call(&self);

    async fn wait_for_incoming_data(&self) -> Result<()>;

    async fn impersonate_client(&self) -> Result<()> {
        Ok(())
    }

    async fn revert_to_self(&self) -> Result<()> {
        Ok(())
    }

    fn get_top_of_tower(&self) -> Result<Vec<u8>>;

    async fn is_authorized(&self) -> bool {
        true
    }

    async fn authorize(&self, _first_time: bool, _in_data: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn secure_packet(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    async fn inquire_auth_client(&self) -> Result<AuthClientInfo> {
        Ok(AuthClientInfo::default())
    }

    async fn inquire_client_pid(&self) -> Result<Option<u32>> {
        Ok(None)
    }

    /// Non-null only for `ncacn_http`; every other transport's reads already
    /// return RPC-layer bytes directly, so the default routes through `read`
    /// filling the caller's growable buffer up to one framed message.
    async fn receive_fragment(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut chunk = vec![0u8; 4096];
        let n = self.read(&mut chunk).await?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

/// Parse the top of tower for a given protocol sequence — the inverse of
/// each connection's `get_top_of_tower`, usable without an open connection.
pub fn parse_top_of_tower(
    protseq: ProtocolSequence,
    data: &[u8],
) -> Result<(Option<String>, String)> {
    match protseq {
        ProtocolSequence::NcacnNp => tower::parse_ncacn_np_tower(data),
        ProtocolSequence::Ncalrpc => tower::parse_ncalrpc_tower(data),
        ProtocolSequence::NcacnIpTcp => {
            let (addr, ep) = tower::parse_ncacn_ip_tcp_tower(data)?;
            Ok((Some(addr), ep))
        }
        ProtocolSequence::NcacnHttp => {
            let (addr, ep) = tower::parse_ncacn_http_tower(data)?;
            Ok((Some(addr), ep))
        }
    }
}

/// Exact tower byte size without allocating the tower itself, mirroring
/// `get_top_of_tower(NULL, ...)`.
pub fn top_of_tower_size(
    protseq: ProtocolSequence,
    network_addr: Option<&str>,
    endpoint: Option<&str>,
) -> Result<usize> {
    Ok(match protseq {
        ProtocolSequence::NcacnNp => tower::ncacn_np_tower_size(network_addr, endpoint),
        ProtocolSequence::Ncalrpc => tower::ncalrpc_tower_size(endpoint),
        ProtocolSequence::NcacnIpTcp => tower::ncacn_ip_tcp_tower_size(),
        ProtocolSequence::NcacnHttp => tower::ncacn_http_tower_size(),
    })
}

/// Tagged variant of connection kinds — the re-expression the spec's Design
/// Notes call for in place of a function-pointer vtable. Each arm owns one
/// transport's concrete connection type.
#[derive(Clone)]
pub enum AnyConnection {
    Pipe(Arc<pipe::PipeConnection>),
    Tcp(Arc<tcp::TcpConnection>),
    Http(Arc<http::HttpConnection>),
}

macro_rules! dispatch {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match $self {
            AnyConnection::Pipe(c) => c.$method($($arg),*).await,
            AnyConnection::Tcp(c) => c.$method($($arg),*).await,
            AnyConnection::Http(c) => c.$method($($arg),*).await,
        }
    };
}

#[async_trait]
impl Connection for AnyConnection {
    fn protocol_sequence(&self) -> ProtocolSequence {
        match self {
            AnyConnection::Pipe(c) => c.protocol_sequence(),
            AnyConnection::Tcp(c) => c.protocol_sequence(),
            AnyConnection::Http(c) => c.protocol_sequence(),
        }
    }

    fn is_server(&self) -> bool {
        match self {
            AnyConnection::Pipe(c) => c.is_server(),
            AnyConnection::Tcp(c) => c.is_server(),
            AnyConnection::Http(c) => c.is_server(),
        }
    }

    fn network_addr(&self) -> Option<&str> {
        match self {
            AnyConnection::Pipe(c) => c.network_addr(),
            AnyConnection::Tcp(c) => c.network_addr(),
            AnyConnection::Http(c) => c.network_addr(),
        }
    }

    fn endpoint(&self) -> Option<&str> {
        match self {
            AnyConnection::Pipe(c) => c.endpoint(),
            AnyConnection::Tcp(c) => c.endpoint(),
            AnyConnection::Http(c) => c.endpoint(),
        }
    }

    fn max_transmission_size(&self) -> usize {
        match self {
            AnyConnection::Pipe(c) => c.max_transmission_size(),
            AnyConnection::Tcp(c) => c.max_transmission_size(),
            AnyConnection::Http(c) => c.max_transmission_size(),
        }
    }

    async fn open(&self) -> Result<()> {
        dispatch!(self, open)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        dispatch!(self, read, buf)
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        dispatch!(self, write, buf)
    }

    async fn close(&self) -> Result<()> {
        dispatch!(self, close)
    }

    async fn close_read(&self) -> Result<()> {
        dispatch!(self, close_read)
    }

    fn cancel_call(&self) {
        match self {
            AnyConnection::Pipe(c) => c.cancel_call(),
            AnyConnection::Tcp(c) => c.cancel_call(),
            AnyConnection::Http(c) => c.cancel_call(),
        }
    }

    async fn wait_for_incoming_data(&self) -> Result<()> {
        dispatch!(self, wait_for_incoming_data)
    }

    async fn impersonate_client(&self) -> Result<()> {
        dispatch!(self, impersonate_client)
    }

    async fn revert_to_self(&self) -> Result<()> {
        dispatch!(self, revert_to_self)
    }

    fn get_top_of_tower(&self) -> Result<Vec<u8>> {
        match self {
            AnyConnection::Pipe(c) => c.get_top_of_tower(),
            AnyConnection::Tcp(c) => c.get_top_of_tower(),
            AnyConnection::Http(c) => c.get_top_of_tower(),
        }
    }

    async fn is_authorized(&self) -> bool {
        dispatch!(self, is_authorized)
    }

    async fn authorize(&self, first_time: bool, in_data: &[u8]) -> Result<Vec<u8>> {
        dispatch!(self, authorize, first_time, in_data)
    }

    async fn secure_packet(&self, data: &[u8]) -> Result<Vec<u8>> {
        dispatch!(self, secure_packet, data)
    }

    async fn inquire_auth_client(&self) -> Result<AuthClientInfo> {
        dispatch!(self, inquire_auth_client)
    }

    async fn inquire_client_pid(&self) -> Result<Option<u32>> {
        dispatch!(self, inquire_client_pid)
    }

    async fn receive_fragment(&self, buf: &mut Vec<u8>) -> Result<()> {
        dispatch!(self, receive_fragment, buf)
    }
}

/// Explicit reference counting over an [`AnyConnection`], per spec §4.5.
///
/// Rust's `Arc` already frees memory at zero strong references, but the spec
/// additionally requires that the *transport* be closed exactly once, at the
/// moment the explicit count (not necessarily the same as outstanding
/// `Arc` clones — callers may hold an `Arc<ConnectionHandle>` themselves)
/// reaches zero, and that a waiter can block until that has happened
/// (`release_and_wait`). This is modeled as its own atomic counter plus a
/// `Notify`, independent of `Arc`'s bookkeeping.
pub struct ConnectionHandle {
    conn: AnyConnection,
    refcount: AtomicUsize,
    wait_release: Notify,
    next_call_id: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(conn: AnyConnection) -> Arc<Self> {
        Arc::new(Self {
            conn,
            refcount: AtomicUsize::new(1),
            wait_release: Notify::new(),
            next_call_id: AtomicU64::new(1),
        })
    }

    pub fn conn(&self) -> &AnyConnection {
        &self.conn
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn next_call_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Increment the explicit refcount. The caller keeps its existing
    /// `Arc<ConnectionHandle>` clone; `grab` only models the count.
    pub fn grab(self: &Arc<Self>) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the explicit refcount; closes the underlying connection and
    /// wakes any `release_and_wait` callers when it reaches zero.
    pub async fn release(self: &Arc<Self>) -> Result<()> {
        if self.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.conn.close().await?;
            self.wait_release.notify_waiters();
        }
        Ok(())
    }

    /// Release, then block until a concurrent release (from another grabbed
    /// reference) has driven the refcount to zero and closed the
    /// connection — used by a caller that must be sure no further I/O is in
    /// flight before it proceeds.
    pub async fn release_and_wait(self: &Arc<Self>) -> Result<()> {
        let already_last = self.refcount.load(Ordering::SeqCst) <= 1;
        if already_last {
            return self.release().await;
        }
        let notified = self.wait_release.notified();
        self.release().await?;
        notified.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_sequence_lookup_is_case_sensitive() {
        assert_eq!(
            ProtocolSequence::from_name("ncacn_ip_tcp"),
            Some(ProtocolSequence::NcacnIpTcp)
        );
        assert!(ProtocolSequence::from_name("NCACN_IP_TCP").is_none());
        assert!(ProtocolSequence::from_name("bogus").is_none());
    }
}
