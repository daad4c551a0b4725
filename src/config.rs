//! # Transport Configuration
//!
//! Mirrors the teacher crate's `TransportConfig` (one struct, sensible
//! `Default`, per-protseq fields) but scoped to what the transport contract
//! in spec §3/§4 actually needs: QoS/impersonation level, credentials, and
//! the HTTP-only `NetworkOptions` string.

/// Impersonation level requested by the caller for a connection, mapped onto
/// local-pipe security-quality-of-service flags per spec §4.2.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImpersonationLevel {
    Anonymous,
    Identify,
    #[default]
    Impersonate,
    Delegate,
}

/// Quality-of-service descriptor threaded through to transport `open`.
#[derive(Debug, Clone, Default)]
pub struct Qos {
    pub impersonation_level: ImpersonationLevel,
    /// Dynamic identity tracking; adds context tracking to the pipe's SQOS
    /// flags for local-pipe transports.
    pub identity_tracking: bool,
    /// Use TLS for `ncacn_http` (selects `https://` and port 443 by default).
    pub use_ssl: bool,
}

/// Opaque credential material handed to the transport's authentication
/// loop. Higher-level authentication negotiation (scheme selection beyond
/// what this transport drives itself for HTTP) is out of scope.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    pub username: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
}

/// Parsed `RpcProxy=`/`HttpProxy=` options for `ncacn_http`, per spec §6.
///
/// `NetworkOptions` on the wire is a comma-separated, case-insensitive-key
/// list; any key other than the two recognized ones is traced and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpProxyOptions {
    pub rpc_proxy: Option<(String, Option<u16>)>,
    pub http_proxy: Option<(String, Option<u16>)>,
}

impl HttpProxyOptions {
    pub fn parse(network_options: &str) -> Self {
        let mut out = Self::default();
        for entry in network_options.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Some((key, value)) = entry.split_once('=') else {
                tracing::warn!(key = entry, "unrecognized NetworkOptions entry, ignoring");
                continue;
            };
            let parsed = parse_host_port(value);
            match key.to_ascii_lowercase().as_str() {
                "rpcproxy" => out.rpc_proxy = Some(parsed),
                "httpproxy" => out.http_proxy = Some(parsed),
                other => tracing::warn!(key = other, "unhandled NetworkOptions key, ignoring"),
            }
        }
        out
    }
}

fn parse_host_port(value: &str) -> (String, Option<u16>) {
    match value.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(p) => (host.to_string(), Some(p)),
            Err(_) => (value.to_string(), None),
        },
        None => (value.to_string(), None),
    }
}

/// Connection configuration supplied by the caller before `open`.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub network_addr: Option<String>,
    pub endpoint: Option<String>,
    pub network_options: Option<String>,
    pub cookie_auth: Option<String>,
    pub qos: Qos,
    pub auth_info: Option<AuthInfo>,
    /// Whether the client should block indefinitely waiting for a busy or
    /// absent server, per spec §4.2.1.
    pub wait: bool,
    pub max_transmission_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            network_addr: None,
            endpoint: None,
            network_options: None,
            cookie_auth: None,
            qos: Qos::default(),
            auth_info: None,
            wait: true,
            max_transmission_size: 5840,
        }
    }
}

/// Listener configuration supplied by the caller before creating a server
/// protseq endpoint.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub endpoint: Option<String>,
    /// Accept backlog / queue length ("max calls").
    pub max_calls: usize,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_calls: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_keys_case_insensitively() {
        let opts = HttpProxyOptions::parse("RpcProxy=proxy.example.com:443,HttpProxy=gw:8080");
        assert_eq!(
            opts.rpc_proxy,
            Some(("proxy.example.com".to_string(), Some(443)))
        );
        assert_eq!(opts.http_proxy, Some(("gw".to_string(), Some(8080))));
    }

    #[test]
    fn ignores_unknown_keys_and_missing_port() {
        let opts = HttpProxyOptions::parse("RpcProxy=proxy.example.com,SomethingElse=1");
        assert_eq!(opts.rpc_proxy, Some(("proxy.example.com".to_string(), None)));
        assert_eq!(opts.http_proxy, None);
    }
}
