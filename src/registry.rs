//! # Transport Registry
//!
//! Maps protocol sequence names to the connection/listener constructors for
//! that transport, the single entry point the rest of the RPC runtime goes
//! through instead of naming `PipeConnection`/`TcpConnection`/`HttpConnection`
//! directly. Lookup is case-sensitive, per spec §4.1.

use crate::config::{ConnectOptions, ListenOptions};
use crate::connection::http::HttpConnection;
use crate::connection::pipe::PipeConnection;
use crate::connection::tcp::TcpConnection;
use crate::connection::{AnyConnection, ProtocolSequence};
use crate::error::{Result, TransportError};
use crate::listener::ProtseqListener;
use std::path::PathBuf;

/// Root directory local-pipe transports use for their backing Unix sockets.
#[derive(Debug, Clone)]
pub struct TransportRegistry {
    pipe_root: PathBuf,
}

impl TransportRegistry {
    pub fn new(pipe_root: impl Into<PathBuf>) -> Self {
        Self {
            pipe_root: pipe_root.into(),
        }
    }

    fn resolve(&self, protseq_name: &str) -> Result<ProtocolSequence> {
        ProtocolSequence::from_name(protseq_name).ok_or_else(|| TransportError::ProtseqNotSupported {
            name: protseq_name.to_string(),
        })
    }

    /// Open a client connection for the named protocol sequence.
    pub fn open_connection(&self, protseq_name: &str, opts: &ConnectOptions) -> Result<AnyConnection> {
        let protseq = self.resolve(protseq_name)?;
        Ok(match protseq {
            ProtocolSequence::Ncalrpc | ProtocolSequence::NcacnNp => {
                let endpoint = opts
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| match protseq {
                        ProtocolSequence::Ncalrpc => crate::connection::pipe::generate_ncalrpc_endpoint(),
                        _ => crate::connection::pipe::generate_ncacn_np_endpoint(),
                    });
                AnyConnection::Pipe(PipeConnection::client(
                    protseq,
                    &self.pipe_root,
                    endpoint,
                    opts.max_transmission_size,
                ))
            }
            ProtocolSequence::NcacnIpTcp => {
                let network_addr = opts
                    .network_addr
                    .clone()
                    .ok_or_else(|| TransportError::InvalidEndpointFormat { endpoint: String::new() })?;
                let endpoint = opts
                    .endpoint
                    .clone()
                    .ok_or_else(|| TransportError::InvalidEndpointFormat { endpoint: String::new() })?;
                AnyConnection::Tcp(TcpConnection::client(network_addr, endpoint, opts.max_transmission_size))
            }
            ProtocolSequence::NcacnHttp => AnyConnection::Http(HttpConnection::client(opts)),
        })
    }

    /// Create a listening endpoint for the named protocol sequence. Returns
    /// `Unsupported` for `ncacn_http`, which this transport only drives as a
    /// client (§9 Open Question).
    pub async fn create_listening_endpoint(
        &self,
        protseq_name: &str,
        opts: &ListenOptions,
    ) -> Result<ProtseqListener> {
        let protseq = self.resolve(protseq_name)?;
        let endpoint = opts
            .endpoint
            .clone()
            .unwrap_or_else(|| match protseq {
                ProtocolSequence::Ncalrpc => crate::connection::pipe::generate_ncalrpc_endpoint(),
                ProtocolSequence::NcacnNp => crate::connection::pipe::generate_ncacn_np_endpoint(),
                _ => "0".to_string(),
            });
        match protseq {
            ProtocolSequence::Ncalrpc | ProtocolSequence::NcacnNp => {
                ProtseqListener::bind_pipe(protseq, &self.pipe_root, &endpoint).await
            }
            ProtocolSequence::NcacnIpTcp => ProtseqListener::bind_tcp("0.0.0.0", &endpoint).await,
            ProtocolSequence::NcacnHttp => Err(TransportError::Unsupported(
                "ncacn_http server endpoints are not implemented; this transport is client-only".into(),
            )),
        }
    }

    pub fn is_server_listening_path(&self, protseq_name: &str, endpoint: &str) -> Result<PathBuf> {
        let protseq = self.resolve(protseq_name)?;
        Ok(crate::connection::pipe::socket_path(protseq, &self.pipe_root, endpoint))
    }
}

/// Probes whether a server is currently listening on the given protocol
/// sequence/endpoint, without opening a full connection. Local pipes check
/// for the existence of the backing socket file; `ncacn_ip_tcp` attempts a
/// bare TCP connect; `ncacn_http` issues an HTTP HEAD request.
///
/// This resolves spec §9's Open Question: rather than stubbing
/// `AccessDenied` unconditionally, each transport gets the cheapest real
/// liveness probe that doesn't require a full authenticated connection.
pub async fn is_server_listening(registry: &TransportRegistry, protseq_name: &str, network_addr: Option<&str>, endpoint: &str) -> Result<bool> {
    let protseq = registry.resolve(protseq_name)?;
    match protseq {
        ProtocolSequence::Ncalrpc | ProtocolSequence::NcacnNp => {
            let path = crate::connection::pipe::socket_path(protseq, &registry.pipe_root, endpoint);
            Ok(path.exists())
        }
        ProtocolSequence::NcacnIpTcp => {
            let addr = format!("{}:{}", network_addr.unwrap_or("127.0.0.1"), endpoint);
            Ok(tokio::net::TcpStream::connect(&addr).await.is_ok())
        }
        ProtocolSequence::NcacnHttp => {
            let host = network_addr.ok_or(TransportError::NoContextAvailable)?;
            let url = format!("https://{host}:{endpoint}/rpc/rpcproxy.dll");
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
            Ok(client.head(&url).send().await.is_ok())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protseq_is_rejected() {
        let registry = TransportRegistry::new("/tmp");
        let err = registry.resolve("ncacn_zzz").unwrap_err();
        assert!(matches!(err, TransportError::ProtseqNotSupported { .. }));
    }

    #[tokio::test]
    async fn http_server_endpoints_are_unsupported() {
        let registry = TransportRegistry::new("/tmp");
        let err = registry
            .create_listening_endpoint("ncacn_http", &ListenOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }

    #[tokio::test]
    async fn tcp_connection_requires_network_addr() {
        let registry = TransportRegistry::new("/tmp");
        let opts = ConnectOptions {
            endpoint: Some("135".to_string()),
            ..Default::default()
        };
        let err = registry.open_connection("ncacn_ip_tcp", &opts).unwrap_err();
        assert!(matches!(err, TransportError::InvalidEndpointFormat { .. }));
    }
}
