use anyhow::Result;
use dce_rpc_transport::config::{ConnectOptions, ListenOptions};
use dce_rpc_transport::{Acceptor, Connection, TransportRegistry};

/// Verify a full client/server round trip through the registry for both
/// local transports, the way a caller outside this crate would actually
/// drive it: resolve a protocol sequence by name, bind a listener, open a
/// client connection, and exchange a message.
#[tokio::test]
async fn ncalrpc_round_trip_through_registry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = TransportRegistry::new(dir.path());

    let listener = registry
        .create_listening_endpoint("ncalrpc", &ListenOptions::default())
        .await?;
    let endpoint = listener.endpoint().to_string();
    let mut acceptor = Acceptor::spawn(vec![listener], 5840, ListenOptions::default());

    let server = tokio::spawn(async move {
        let conn = acceptor.accept().await.expect("listener closed unexpectedly");
        let mut buf = Vec::new();
        conn.receive_fragment(&mut buf).await.unwrap();
        conn.write(&buf).await.unwrap();
    });

    let opts = ConnectOptions {
        endpoint: Some(endpoint),
        ..ConnectOptions::default()
    };
    let client = registry.open_connection("ncalrpc", &opts)?;
    client.open().await?;
    client.write(b"ping").await?;
    let mut reply = vec![0u8; 4];
    client.read(&mut reply).await?;
    client.close().await?;

    server.await?;
    assert_eq!(&reply, b"ping");
    Ok(())
}

/// Same scenario over `ncacn_ip_tcp`, binding an ephemeral port.
#[tokio::test]
async fn tcp_round_trip_through_registry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = TransportRegistry::new(dir.path());

    let listener = registry
        .create_listening_endpoint(
            "ncacn_ip_tcp",
            &ListenOptions {
                endpoint: Some("0".to_string()),
                ..ListenOptions::default()
            },
        )
        .await?;
    let port = listener.endpoint().to_string();
    let mut acceptor = Acceptor::spawn(vec![listener], 5840, ListenOptions::default());

    let server = tokio::spawn(async move {
        let conn = acceptor.accept().await.expect("listener closed unexpectedly");
        let mut buf = Vec::new();
        conn.receive_fragment(&mut buf).await.unwrap();
        conn.write(&buf).await.unwrap();
    });

    let opts = ConnectOptions {
        network_addr: Some("127.0.0.1".to_string()),
        endpoint: Some(port),
        ..ConnectOptions::default()
    };
    let client = registry.open_connection("ncacn_ip_tcp", &opts)?;
    client.open().await?;
    client.write(b"pong!").await?;
    let mut reply = vec![0u8; 5];
    client.read(&mut reply).await?;
    client.close().await?;

    server.await?;
    assert_eq!(&reply, b"pong!");
    Ok(())
}

/// An unregistered protocol sequence name is rejected before any socket
/// work happens, regardless of whether it's a connect or a listen.
#[tokio::test]
async fn unknown_protocol_sequence_is_rejected_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let registry = TransportRegistry::new(dir.path());

    assert!(registry
        .open_connection("ncacn_nope", &ConnectOptions::default())
        .is_err());
    assert!(registry
        .create_listening_endpoint("ncacn_nope", &ListenOptions::default())
        .await
        .is_err());
}
