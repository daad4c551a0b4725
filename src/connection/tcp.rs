//! # `ncacn_ip_tcp` Connection
//!
//! Grounded in the teacher's `TcpSocketTransport` (bind/connect, `socket2`
//! nodelay tuning) but re-expressed against the [`Connection`] contract: one
//! object per call-carrying stream rather than a connection-id-keyed map,
//! `&self` interior-mutable I/O so a single [`AnyConnection`] can be shared
//! across the read and write halves of a call, and cooperative cancellation
//! via [`tokio::sync::Notify`] instead of a hard write timeout.

use super::{AuthClientInfo, Connection, ProtocolSequence};
use crate::error::{Result, TransportError};
use crate::tower;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Disables Nagle's algorithm, mirroring the teacher's `start_client`/
/// `start_server` socket tuning: drop to a std socket, tune it through
/// `socket2`, and hand a fresh `TcpStream` back.
fn tune(stream: TcpStream) -> Result<TcpStream> {
    let std_stream = stream.into_std().map_err(TransportError::Io)?;
    let socket = socket2::Socket::from(std_stream.try_clone().map_err(TransportError::Io)?);
    socket.set_nodelay(true).map_err(TransportError::Io)?;
    TcpStream::from_std(std_stream).map_err(TransportError::Io)
}

/// Live `ncacn_ip_tcp` connection: a connected or about-to-connect
/// `TcpStream` plus cooperative cancellation state.
pub struct TcpConnection {
    is_server: bool,
    network_addr: Option<String>,
    endpoint: Option<String>,
    stream: Mutex<Option<TcpStream>>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    max_transmission_size: usize,
}

impl TcpConnection {
    /// Client side: `open` will connect to `network_addr:endpoint`.
    pub fn client(network_addr: String, endpoint: String, max_transmission_size: usize) -> Arc<Self> {
        Arc::new(Self {
            is_server: false,
            network_addr: Some(network_addr),
            endpoint: Some(endpoint),
            stream: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            max_transmission_size,
        })
    }

    /// Server side: wraps a stream already produced by `TcpListener::accept`.
    pub fn from_accepted(stream: TcpStream, peer: SocketAddr, max_transmission_size: usize) -> Result<Arc<Self>> {
        let stream = tune(stream)?;
        Ok(Arc::new(Self {
            is_server: true,
            network_addr: Some(peer.ip().to_string()),
            endpoint: Some(peer.port().to_string()),
            stream: Mutex::new(Some(stream)),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            max_transmission_size,
        }))
    }

    pub async fn bind(network_addr: &str, endpoint: &str) -> Result<TcpListener> {
        let addr = format!("{}:{}", network_addr, endpoint);
        TcpListener::bind(&addr).await.map_err(|e| TransportError::CantCreateEndpoint {
            endpoint: addr,
            source: e,
        })
    }
}

#[async_trait::async_trait]
impl Connection for TcpConnection {
    fn protocol_sequence(&self) -> ProtocolSequence {
        ProtocolSequence::NcacnIpTcp
    }

    fn is_server(&self) -> bool {
        self.is_server
    }

    fn network_addr(&self) -> Option<&str> {
        self.network_addr.as_deref()
    }

    fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn max_transmission_size(&self) -> usize {
        self.max_transmission_size
    }

    async fn open(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let addr = format!(
            "{}:{}",
            self.network_addr.as_deref().unwrap_or(""),
            self.endpoint.as_deref().unwrap_or("")
        );
        debug!(%addr, "connecting ncacn_ip_tcp");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::ServerUnavailable { endpoint: addr.clone(), source: e })?;
        let stream = tune(stream)?;
        *guard = Some(stream);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NoContextAvailable)?;
        tokio::select! {
            res = stream.read(buf) => {
                let n = res?;
                if n == 0 && !buf.is_empty() {
                    return Err(TransportError::ProtocolError("peer closed the connection".into()));
                }
                Ok(n)
            }
            _ = self.cancel_notify.notified() => Err(TransportError::CallCancelled),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NoContextAvailable)?;
        tokio::select! {
            res = stream.write_all(buf) => { res?; Ok(()) }
            _ = self.cancel_notify.notified() => Err(TransportError::CallCancelled),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        *guard = None;
        Ok(())
    }

    async fn close_read(&self) -> Result<()> {
        let guard = self.stream.lock().await;
        if let Some(stream) = guard.as_ref() {
            // `tokio::net::TcpStream` only exposes the write-half shutdown via
            // `AsyncWriteExt`; a borrowed `socket2::SockRef` gets us the same
            // read-half-only `shutdown(Shutdown::Read)` the pipe transport uses,
            // without taking ownership of the stream.
            let _ = socket2::SockRef::from(stream).shutdown(std::net::Shutdown::Read);
        }
        Ok(())
    }

    fn cancel_call(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    async fn wait_for_incoming_data(&self) -> Result<()> {
        let guard = self.stream.lock().await;
        let stream = guard.as_ref().ok_or(TransportError::NoContextAvailable)?;
        stream.readable().await?;
        Ok(())
    }

    fn get_top_of_tower(&self) -> Result<Vec<u8>> {
        tower::ncacn_ip_tcp_tower(self.network_addr.as_deref(), self.endpoint.as_deref())
    }

    async fn inquire_auth_client(&self) -> Result<AuthClientInfo> {
        Ok(AuthClientInfo::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn round_trip_over_loopback() {
        let listener = TcpConnection::bind("127.0.0.1", "0").await.unwrap();
        let local = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let conn = TcpConnection::from_accepted(stream, peer, 5840).unwrap();
            let mut buf = [0u8; 5];
            let n = conn.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello");
            conn.write(b"world").await.unwrap();
        });

        let client = TcpConnection::client(
            Ipv4Addr::LOCALHOST.to_string(),
            local.port().to_string(),
            5840,
        );
        client.open().await.unwrap();
        client.write(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_call_unblocks_pending_read() {
        let listener = TcpConnection::bind("127.0.0.1", "0").await.unwrap();
        let local = listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client_stream = TcpStream::connect(local).await.unwrap();
        let (stream, peer) = accept_task.await.unwrap();
        let _keep_alive = client_stream;

        let conn = TcpConnection::from_accepted(stream, peer, 5840).unwrap();
        let conn2 = conn.clone();
        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            conn2.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        conn.cancel_call();
        let result = read_task.await.unwrap();
        assert!(matches!(result, Err(TransportError::CallCancelled)));
    }
}
