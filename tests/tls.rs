//! TLS layered beneath the application handshake

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peerwire::config::{ConnectionConfig, NetworkConfig, ServerConfig};
use peerwire::transport::tls::{load_certificates, TlsClientConfig, TlsServerConfig};
use peerwire::{client, ConnectionPool, ConnectionState, Dispatcher, Listener, ProtocolError, TypeRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const SCHEMA: &str = r#"{"messages":[
    {"id":1,"name":"Secret","arguments":[{"name":"text","type":"string","encrypt":true}]}]}"#;

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry.register(SCHEMA).unwrap();
    Arc::new(registry)
}

fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        update_interval: Duration::from_millis(5),
        ..ConnectionConfig::default()
    }
}

fn cert_paths(tag: &str) -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir();
    let stem = format!("peerwire-{tag}-{}", std::process::id());
    (dir.join(format!("{stem}.crt")), dir.join(format!("{stem}.key")))
}

struct TlsServer {
    pool: ConnectionPool<()>,
    address: String,
    cert_path: PathBuf,
    received: mpsc::UnboundedReceiver<String>,
}

async fn start_tls_server(tag: &str) -> TlsServer {
    start_tls_server_with(tag, ServerConfig::default().max_connections).await
}

async fn start_tls_server_with(tag: &str, max_connections: usize) -> TlsServer {
    let (cert_path, key_path) = cert_paths(tag);
    let acceptor = TlsServerConfig::generate_self_signed(&cert_path, &key_path)
        .unwrap()
        .acceptor()
        .unwrap();
    let listener = Listener::bind("127.0.0.1:0").await.unwrap().with_tls(acceptor);
    assert!(listener.is_tls());
    let address = listener.local_addr().unwrap().to_string();

    let (tx, received) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::<()>::new());
    dispatcher
        .on("Secret", move |message, _, _| {
            let _ = tx.send(message.string("text")?.to_string());
            Ok(())
        })
        .unwrap();

    let pool = ConnectionPool::new(
        registry(),
        dispatcher,
        ServerConfig {
            address: address.clone(),
            max_connections,
            ..ServerConfig::default()
        },
        connection_config(),
        || (),
    );
    pool.serve(listener).unwrap();

    TlsServer {
        pool,
        address,
        cert_path,
        received,
    }
}

#[tokio::test]
async fn test_insecure_client_over_tls() {
    let mut server = start_tls_server("insecure").await;
    let registry = registry();

    let config = NetworkConfig::default_with_overrides(|c| {
        c.client.address = server.address.clone();
        c.connection = connection_config();
        c.transport.tls_enabled = true;
        c.transport.tls_insecure = true;
        c.transport.server_name = Some("localhost".into());
    });
    let connection = client::connect(&config, Arc::clone(&registry), Arc::new(Dispatcher::new()), ())
        .await
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Running);

    connection
        .queue_message(registry.instance("Secret").unwrap().with("text", "over tls").unwrap())
        .unwrap();
    let text = tokio::time::timeout(Duration::from_secs(5), server.received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text, "over tls");

    connection.shutdown();
    server.pool.shutdown();
}

#[tokio::test]
async fn test_pinned_certificate_is_accepted() {
    let server = start_tls_server("pinned").await;
    let certificate = load_certificates(&server.cert_path).unwrap().remove(0);
    let pin = TlsClientConfig::calculate_cert_hash(&certificate);

    let stream = TcpStream::connect(server.address.as_str()).await.unwrap();
    let peer = stream.peer_addr().ok();
    let tls = TlsClientConfig::new("localhost")
        .with_pinned_cert_hash(pin)
        .connect(stream)
        .await
        .unwrap();

    let connection = client::connect_stream(
        tls,
        peer,
        &connection_config(),
        registry(),
        Arc::new(Dispatcher::<()>::new()),
        (),
    )
    .await
    .unwrap();
    assert!(connection.handle().is_secure());

    connection.shutdown();
    server.pool.shutdown();
}

#[tokio::test]
async fn test_wrong_pin_is_rejected() {
    let server = start_tls_server("wrong-pin").await;

    let stream = TcpStream::connect(server.address.as_str()).await.unwrap();
    let result = TlsClientConfig::new("localhost")
        .with_pinned_cert_hash(vec![0u8; 32])
        .connect(stream)
        .await;
    assert!(matches!(result, Err(ProtocolError::TlsError(_))));

    server.pool.shutdown();
}

#[tokio::test]
async fn test_connection_limit_counts_pending_tls_accepts() {
    let server = start_tls_server_with("limit", 1).await;
    let registry = registry();
    let config = NetworkConfig::default_with_overrides(|c| {
        c.client.address = server.address.clone();
        c.connection = ConnectionConfig {
            handshake_timeout: Duration::from_secs(5),
            ..connection_config()
        };
        c.transport.tls_enabled = true;
        c.transport.tls_insecure = true;
        c.transport.server_name = Some("localhost".into());
    });

    let attempts = (0..4).map(|_| {
        client::connect(&config, Arc::clone(&registry), Arc::new(Dispatcher::<()>::new()), ())
    });
    let results = futures::future::join_all(attempts).await;

    let admitted: Vec<_> = results.into_iter().filter_map(Result::ok).collect();
    assert_eq!(admitted.len(), 1);
    assert_eq!(server.pool.len(), 1);

    for connection in &admitted {
        connection.shutdown();
    }
    server.pool.shutdown();
}

#[tokio::test]
async fn test_listener_from_config_requires_key_material() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.transport.tls_enabled = true;
    });
    assert!(matches!(
        Listener::from_config(&config).await,
        Err(ProtocolError::ConfigError(_))
    ));
}
