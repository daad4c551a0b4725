//! # DCE/MSRPC Transport Demo
//!
//! A minimal standalone binary exercising the transport layer end to end:
//! it stands up `ncalrpc` and `ncacn_ip_tcp` listeners behind one
//! [`Acceptor`], opens a client connection against each, and round-trips a
//! single message, logging every step the way a real RPC runtime would.
//!
//! ## Logging
//!
//! Two layers, matching the detailed-file/colorized-stdout split used
//! throughout this codebase: a full-detail layer (file, or stderr via
//! `--log-file stderr`) and a clean colorized layer on stdout, both gated by
//! `-v`/`-vv`.

use anyhow::Result;
use dce_rpc_transport::config::{ConnectOptions, ListenOptions};
use dce_rpc_transport::{Acceptor, Connection, ProtseqListener, TransportRegistry};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let verbosity: u8 = std::env::var("RPC_TRANSPORT_VERBOSE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let quiet = std::env::var("RPC_TRANSPORT_QUIET").is_ok();
    let log_file = std::env::var("RPC_TRANSPORT_LOG_FILE").ok();

    let log_level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if log_file.as_deref() == Some("stderr") {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let (log_dir, log_filename) = match log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                (
                    log_path
                        .parent()
                        .unwrap_or_else(|| std::path::Path::new("."))
                        .to_path_buf(),
                    log_path
                        .file_name()
                        .unwrap_or_else(|| std::ffi::OsStr::new("rpc-transport.log"))
                        .to_owned(),
                )
            }
            None => (std::path::PathBuf::from("."), "rpc-transport.log".into()),
        };
        let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    let _log_guard = guard;

    info!("starting dce-rpc-transport demo");

    let pipe_root = std::env::temp_dir().join("dce-rpc-transport-demo");
    tokio::fs::create_dir_all(&pipe_root).await?;
    let registry = TransportRegistry::new(pipe_root);

    let ncalrpc_listener = registry
        .create_listening_endpoint("ncalrpc", &ListenOptions::default())
        .await?;
    let tcp_listener = registry
        .create_listening_endpoint("ncacn_ip_tcp", &ListenOptions {
            endpoint: Some("0".to_string()),
            ..ListenOptions::default()
        })
        .await?;

    info!(endpoint = ncalrpc_listener.endpoint(), "ncalrpc listening");
    info!(endpoint = tcp_listener.endpoint(), "ncacn_ip_tcp listening");

    let ncalrpc_endpoint = ncalrpc_listener.endpoint().to_string();
    let tcp_endpoint = tcp_listener.endpoint().to_string();

    let mut acceptor = Acceptor::spawn(
        vec![ncalrpc_listener, tcp_listener],
        dce_rpc_transport::defaults::MAX_TRANSMISSION_SIZE,
        ListenOptions::default(),
    );

    let server_task = tokio::spawn(async move {
        for _ in 0..2 {
            match acceptor.accept().await {
                Some(conn) => {
                    if let Err(e) = echo_once(&conn).await {
                        error!(error = %e, "server-side echo failed");
                    }
                }
                None => break,
            }
        }
    });

    roundtrip(&registry, "ncalrpc", None, &ncalrpc_endpoint, b"hello over ncalrpc").await?;
    roundtrip(
        &registry,
        "ncacn_ip_tcp",
        Some("127.0.0.1"),
        &tcp_endpoint,
        b"hello over ncacn_ip_tcp",
    )
    .await?;

    server_task.await?;
    info!("dce-rpc-transport demo completed successfully");
    Ok(())
}

async fn roundtrip(
    registry: &TransportRegistry,
    protseq: &str,
    network_addr: Option<&str>,
    endpoint: &str,
    payload: &[u8],
) -> Result<()> {
    let opts = ConnectOptions {
        network_addr: network_addr.map(str::to_string),
        endpoint: Some(endpoint.to_string()),
        ..ConnectOptions::default()
    };
    let conn = registry.open_connection(protseq, &opts)?;
    conn.open().await?;
    conn.write(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    conn.read(&mut buf).await?;
    conn.close().await?;
    info!(protseq, reply = %String::from_utf8_lossy(&buf), "round trip complete");
    Ok(())
}

async fn echo_once(conn: &dce_rpc_transport::AnyConnection) -> Result<()> {
    let mut buf = Vec::new();
    conn.receive_fragment(&mut buf).await?;
    conn.write(&buf).await?;
    Ok(())
}
