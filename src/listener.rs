//! # Protseq Listeners and the Acceptor
//!
//! A `ProtseqListener` owns one bound server endpoint (a Unix socket for
//! `ncalrpc`/`ncacn_np`, a `TcpListener` for `ncacn_ip_tcp`) and produces
//! accepted [`AnyConnection`]s. The [`Acceptor`] multiplexes across however
//! many listeners a server has registered, forwarding every accepted
//! connection through one channel — the re-expression of
//! `WaitForMultipleObjectsEx` over a set of listening handles the teacher's
//! `start_multi_server` accept loops implement one-listener-at-a-time.

use crate::config::ListenOptions;
use crate::connection::pipe::PipeConnection;
use crate::connection::tcp::TcpConnection;
use crate::connection::{AnyConnection, ProtocolSequence};
use crate::error::{Result, TransportError};
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// One bound server endpoint for a single protocol sequence.
pub enum ProtseqListener {
    Pipe {
        protseq: ProtocolSequence,
        listener: UnixListener,
        path: PathBuf,
        endpoint: String,
    },
    Tcp {
        listener: TcpListener,
        endpoint: String,
    },
}

impl ProtseqListener {
    pub async fn bind_pipe(protseq: ProtocolSequence, root: &Path, endpoint: &str) -> Result<Self> {
        let (listener, path) = PipeConnection::listen(protseq, root, endpoint).await?;
        Ok(Self::Pipe {
            protseq,
            listener,
            path,
            endpoint: endpoint.to_string(),
        })
    }

    pub async fn bind_tcp(network_addr: &str, endpoint: &str) -> Result<Self> {
        let listener = TcpConnection::bind(network_addr, endpoint).await?;
        let bound_port = listener
            .local_addr()
            .map_err(TransportError::Io)?
            .port()
            .to_string();
        Ok(Self::Tcp {
            listener,
            endpoint: bound_port,
        })
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::Pipe { endpoint, .. } => endpoint,
            Self::Tcp { endpoint, .. } => endpoint,
        }
    }

    async fn accept_one(&self, max_transmission_size: usize) -> Result<AnyConnection> {
        match self {
            Self::Pipe {
                protseq,
                listener,
                path,
                endpoint,
            } => {
                let (stream, _addr) = listener.accept().await.map_err(TransportError::Io)?;
                let conn = PipeConnection::from_accepted(
                    *protseq,
                    stream,
                    path.clone(),
                    endpoint.clone(),
                    max_transmission_size,
                );
                Ok(match protseq {
                    ProtocolSequence::Ncalrpc | ProtocolSequence::NcacnNp => {
                        AnyConnection::Pipe(conn)
                    }
                    _ => unreachable!(),
                })
            }
            Self::Tcp { listener, .. } => {
                let (stream, peer) = listener.accept().await.map_err(TransportError::Io)?;
                let conn = TcpConnection::from_accepted(stream, peer, max_transmission_size)?;
                Ok(AnyConnection::Tcp(conn))
            }
        }
    }
}

/// Multiplexes accept loops across every registered listener for a server,
/// forwarding accepted connections through a single channel.
pub struct Acceptor {
    receiver: mpsc::Receiver<AnyConnection>,
    _tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Acceptor {
    pub fn spawn(listeners: Vec<ProtseqListener>, max_transmission_size: usize, opts: ListenOptions) -> Self {
        let (tx, rx) = mpsc::channel(opts.max_calls.max(1));
        let mut tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept_one(max_transmission_size).await {
                        Ok(conn) => {
                            debug!(endpoint = listener.endpoint(), "accepted connection");
                            if tx.send(conn).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(endpoint = listener.endpoint(), error = %e, "accept failed");
                            break;
                        }
                    }
                }
            }));
        }
        info!(count = tasks.len(), "acceptor listening");
        Self { receiver: rx, _tasks: tasks }
    }

    pub async fn accept(&mut self) -> Option<AnyConnection> {
        self.receiver.recv().await
    }
}
