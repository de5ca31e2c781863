//! End-to-end handshake tests over a tapped stream
//!
//! Every byte between the two peers passes through a relay that records it, so
//! the tests can check what an observer on the wire actually sees.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peerwire::config::ConnectionConfig;
use peerwire::{Connection, ConnectionState, Dispatcher, HandshakeState, Role, TypeRegistry};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

const SCHEMA: &str = r#"{"messages":[
    {"id":1,"name":"Note","arguments":[{"name":"text","type":"string"}]},
    {"id":2,"name":"Login","arguments":[
        {"name":"user","type":"string"},
        {"name":"password","type":"string","encrypt":true}]}]}"#;

const PASSWORD: &str = "correct horse battery staple";

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry.register(SCHEMA).unwrap();
    Arc::new(registry)
}

fn config() -> ConnectionConfig {
    ConnectionConfig {
        update_interval: Duration::from_millis(5),
        ..ConnectionConfig::default()
    }
}

/// Forward bytes from `from` to `to`, appending everything to `record`
async fn relay(mut from: tokio::io::ReadHalf<DuplexStream>, mut to: tokio::io::WriteHalf<DuplexStream>, record: Arc<Mutex<Vec<u8>>>) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        record.lock().unwrap().extend_from_slice(&buf[..n]);
        if to.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = to.shutdown().await;
}

/// Two stream ends joined through a recording relay
fn tapped_pair() -> (DuplexStream, DuplexStream, Arc<Mutex<Vec<u8>>>) {
    let (client_end, tap_client) = tokio::io::duplex(64 * 1024);
    let (tap_server, server_end) = tokio::io::duplex(64 * 1024);
    let record = Arc::new(Mutex::new(Vec::new()));

    let (client_read, client_write) = tokio::io::split(tap_client);
    let (server_read, server_write) = tokio::io::split(tap_server);
    tokio::spawn(relay(client_read, server_write, Arc::clone(&record)));
    tokio::spawn(relay(server_read, client_write, Arc::clone(&record)));

    (client_end, server_end, record)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[tokio::test]
async fn test_handshake_reaches_secure_on_both_sides() {
    let registry = registry();
    let dispatcher = Arc::new(Dispatcher::<()>::new());
    let (client_end, server_end, _) = tapped_pair();

    let client = Connection::new(Role::Initiator, None, Arc::clone(&registry), Arc::clone(&dispatcher), config(), ()).unwrap();
    let server = Connection::new(Role::Acceptor, None, registry, dispatcher, config(), ()).unwrap();
    assert_eq!(client.state(), ConnectionState::Connecting);

    client.start(client_end).unwrap();
    server.start(server_end).unwrap();

    client.wait_secure(Duration::from_secs(5)).await.unwrap();
    server.wait_secure(Duration::from_secs(5)).await.unwrap();
    assert_eq!(client.handshake_state(), HandshakeState::Secure);
    assert_eq!(server.handshake_state(), HandshakeState::Secure);
    assert_eq!(client.state(), ConnectionState::Running);

    server.shutdown();
    server.join().await;
    client.closed().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_encrypted_argument_never_appears_on_the_wire() {
    let registry = registry();
    let dispatcher = Arc::new(Dispatcher::<Option<oneshot::Sender<(String, String)>>>::new());
    dispatcher
        .on("Login", |message, reply, _| {
            let user = message.string("user")?.to_string();
            let password = message.string("password")?.to_string();
            if let Some(reply) = reply.take() {
                let _ = reply.send((user, password));
            }
            Ok(())
        })
        .unwrap();

    let (client_end, server_end, record) = tapped_pair();
    let (tx, rx) = oneshot::channel();
    let client = Connection::new(Role::Initiator, None, Arc::clone(&registry), Arc::clone(&dispatcher), config(), None).unwrap();
    let server = Connection::new(Role::Acceptor, None, Arc::clone(&registry), dispatcher, config(), Some(tx)).unwrap();

    // queued before either side has a key
    let login = registry
        .instance("Login")
        .unwrap()
        .with("user", "alice")
        .unwrap()
        .with("password", PASSWORD)
        .unwrap();
    client.queue_message(login).unwrap();

    client.start(client_end).unwrap();
    server.start(server_end).unwrap();

    let (user, password) = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user, "alice");
    assert_eq!(password, PASSWORD);

    let wire = record.lock().unwrap().clone();
    assert!(contains(&wire, b"alice"), "plain arguments travel in the clear");
    assert!(!contains(&wire, PASSWORD.as_bytes()), "encrypted argument leaked");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_peer_disconnect_during_handshake_fails_wait() {
    let registry = registry();
    let dispatcher = Arc::new(Dispatcher::<()>::new());
    let (client_end, server_end) = tokio::io::duplex(1024);

    let client = Connection::new(Role::Initiator, None, registry, dispatcher, config(), ()).unwrap();
    client.start(client_end).unwrap();
    drop(server_end);

    let result = client.wait_secure(Duration::from_secs(5)).await;
    assert!(matches!(result, Err(peerwire::ProtocolError::ConnectionClosed)));
    client.closed().await;
}

#[tokio::test]
async fn test_wait_secure_times_out_without_a_peer() {
    let registry = registry();
    let dispatcher = Arc::new(Dispatcher::<()>::new());
    let (client_end, _silent) = tokio::io::duplex(64 * 1024);

    let client = Connection::new(Role::Initiator, None, registry, dispatcher, config(), ()).unwrap();
    client.start(client_end).unwrap();

    let result = client.wait_secure(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(peerwire::ProtocolError::Timeout)));
    assert_eq!(client.handshake_state(), HandshakeState::PublicKeySent);
    client.shutdown();
}
