//! Client/server scenarios over real TCP sockets
//!
//! A pooled server answers logins and echoes, broadcasts announcements, and
//! cleans up after clients that go away.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peerwire::config::{ConnectionConfig, NetworkConfig, ServerConfig};
use peerwire::utils::{pending, Completer};
use peerwire::{
    client, Connection, ConnectionPool, ConnectionState, Dispatcher, Listener, ProtocolError, TypeRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SCHEMA: &str = r#"{"messages":[
    {"id":1,"name":"Login","arguments":[
        {"name":"user","type":"string"},
        {"name":"password","type":"string","encrypt":true}]},
    {"id":2,"name":"LoginResult","arguments":[
        {"name":"accepted","type":"bool"},
        {"name":"greeting","type":"string"}]},
    {"id":3,"name":"Echo","arguments":[{"name":"text","type":"string"}]},
    {"id":4,"name":"Announcement","arguments":[{"name":"text","type":"string"}]}]}"#;

#[derive(Default)]
struct ServerSession {
    user: Option<String>,
    ticks: u64,
}

#[derive(Default)]
struct ClientSession {
    login: Option<Completer<(bool, String)>>,
    inbox: Option<mpsc::UnboundedSender<(String, String)>>,
}

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

fn server_dispatcher(registry: &Arc<TypeRegistry>) -> Arc<Dispatcher<ServerSession>> {
    let dispatcher = Arc::new(Dispatcher::<ServerSession>::new());

    let replies = Arc::clone(registry);
    dispatcher
        .on("Login", move |message, session: &mut ServerSession, connection| {
            let user = message.string("user")?.to_string();
            let accepted = message.string("password")? == "open sesame";
            let greeting = if accepted {
                session.user = Some(user.clone());
                format!("welcome, {user}")
            } else {
                "denied".to_string()
            };
            connection.queue_message(
                replies
                    .instance("LoginResult")?
                    .with("accepted", accepted)?
                    .with("greeting", greeting)?,
            )
        })
        .unwrap();

    let replies = Arc::clone(registry);
    dispatcher
        .on("Echo", move |message, session: &mut ServerSession, connection| {
            let text = match &session.user {
                Some(user) => format!("{user}: {}", message.string("text")?),
                None => message.string("text")?.to_string(),
            };
            connection.queue_message(replies.instance("Echo")?.with("text", text)?)
        })
        .unwrap();

    dispatcher
}

fn client_dispatcher() -> Arc<Dispatcher<ClientSession>> {
    let dispatcher = Arc::new(Dispatcher::<ClientSession>::new());
    dispatcher
        .on("LoginResult", |message, session: &mut ClientSession, _| {
            if let Some(login) = session.login.take() {
                let _ = login.complete((message.bool("accepted")?, message.string("greeting")?.to_string()));
            }
            Ok(())
        })
        .unwrap();
    for name in ["Echo", "Announcement"] {
        dispatcher
            .on(name, |message, session: &mut ClientSession, _| {
                if let Some(inbox) = &session.inbox {
                    let _ = inbox.send((message.name().to_string(), message.string("text")?.to_string()));
                }
                Ok(())
            })
            .unwrap();
    }
    dispatcher
}

struct Server {
    pool: ConnectionPool<ServerSession>,
    config: NetworkConfig,
}

async fn start_server(registry: &Arc<TypeRegistry>, max_connections: usize) -> Server {
    start_server_with(registry, max_connections, connection_config()).await
}

async fn start_server_with(
    registry: &Arc<TypeRegistry>,
    max_connections: usize,
    connection: ConnectionConfig,
) -> Server {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let server = ServerConfig {
        address: address.clone(),
        max_connections,
        maintenance_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    };
    let pool = ConnectionPool::new(
        Arc::clone(registry),
        server_dispatcher(registry),
        server,
        connection,
        ServerSession::default,
    );
    pool.serve(listener).unwrap();

    let config = NetworkConfig::default_with_overrides(|c| {
        c.client.address = address;
        c.connection = connection_config();
    });
    Server { pool, config }
}

async fn connect(
    server: &Server,
    registry: &Arc<TypeRegistry>,
    session: ClientSession,
) -> Connection<ClientSession> {
    client::connect(&server.config, Arc::clone(registry), client_dispatcher(), session)
        .await
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_echo_returns_text_unchanged() {
    let registry = registry();
    let server = start_server(&registry, 16).await;

    let (inbox, mut received) = mpsc::unbounded_channel();
    let connection = connect(
        &server,
        &registry,
        ClientSession {
            login: None,
            inbox: Some(inbox),
        },
    )
    .await;

    connection
        .queue_message(registry.instance("Echo").unwrap().with("text", "abc").unwrap())
        .unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, ("Echo".to_string(), "abc".to_string()));

    connection.shutdown();
    let late = registry.instance("Echo").unwrap().with("text", "late").unwrap();
    assert!(matches!(connection.queue_message(late), Err(ProtocolError::QueueClosed)));
    connection.join().await;
    server.pool.shutdown();
}

#[tokio::test]
async fn test_login_then_echo() {
    let registry = registry();
    let server = start_server(&registry, 16).await;

    let (completer, login) = pending();
    let (inbox, mut received) = mpsc::unbounded_channel();
    let connection = connect(
        &server,
        &registry,
        ClientSession {
            login: Some(completer),
            inbox: Some(inbox),
        },
    )
    .await;
    assert_eq!(connection.state(), ConnectionState::Running);

    connection
        .queue_message(
            registry
                .instance("Login")
                .unwrap()
                .with("user", "alice")
                .unwrap()
                .with("password", "open sesame")
                .unwrap(),
        )
        .unwrap();
    let (accepted, greeting) = login.wait(Duration::from_secs(5)).await.unwrap();
    assert!(accepted);
    assert_eq!(greeting, "welcome, alice");

    connection
        .queue_message(registry.instance("Echo").unwrap().with("text", "hi").unwrap())
        .unwrap();
    let (name, text) = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "Echo");
    assert_eq!(text, "alice: hi");

    connection.shutdown();
    server.pool.shutdown();
    server.pool.join().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let registry = registry();
    let server = start_server(&registry, 16).await;

    let mut clients = Vec::new();
    let mut inboxes = Vec::new();
    for _ in 0..3 {
        let (inbox, received) = mpsc::unbounded_channel();
        clients.push(
            connect(
                &server,
                &registry,
                ClientSession {
                    login: None,
                    inbox: Some(inbox),
                },
            )
            .await,
        );
        inboxes.push(received);
    }

    let pool = server.pool.clone();
    wait_until(|| {
        pool.connections().len() == 3 && pool.connections().iter().all(|c| c.handle().is_secure())
    })
    .await;

    let announcement = registry
        .instance("Announcement")
        .unwrap()
        .with("text", "server restarting")
        .unwrap();
    assert_eq!(server.pool.broadcast(&announcement), 3);

    for received in inboxes.iter_mut() {
        let (name, text) = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "Announcement");
        assert_eq!(text, "server restarting");
    }

    for client in &clients {
        client.shutdown();
    }
    server.pool.shutdown();
}

#[tokio::test]
async fn test_maintenance_removes_departed_clients() {
    let registry = registry();
    let server = start_server(&registry, 16).await;

    let departed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&departed);
    server.pool.add_shutdown_hook(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let visits = Arc::new(AtomicUsize::new(0));
    let visit_counter = Arc::clone(&visits);
    server.pool.add_periodic_task(move |_| {
        visit_counter.fetch_add(1, Ordering::SeqCst);
    });

    let connection = connect(&server, &registry, ClientSession::default()).await;
    let pool = server.pool.clone();
    wait_until(|| pool.len() == 1).await;
    wait_until(|| visits.load(Ordering::SeqCst) > 0).await;

    connection.shutdown();
    connection.join().await;

    wait_until(|| departed.load(Ordering::SeqCst) == 1 && pool.is_empty()).await;

    server.pool.shutdown();
    assert!(server.pool.is_shutdown());
}

#[tokio::test]
async fn test_connection_templates_apply_to_new_connections() {
    let registry = registry();
    let server = start_server(&registry, 16).await;

    let ticked = Arc::new(AtomicUsize::new(0));
    let tick_counter = Arc::clone(&ticked);
    server.pool.add_connection_task(move |session: &mut ServerSession, _| {
        session.ticks += 1;
        if session.ticks == 3 {
            tick_counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    server
        .pool
        .add_connection_shutdown_hook(move |session: &mut ServerSession, _| {
            let _ = closed_tx.send(session.ticks);
        });

    let first = connect(&server, &registry, ClientSession::default()).await;
    let second = connect(&server, &registry, ClientSession::default()).await;
    let counter = Arc::clone(&ticked);
    wait_until(|| counter.load(Ordering::SeqCst) == 2).await;

    first.shutdown();
    second.shutdown();
    for _ in 0..2 {
        let ticks = tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(ticks >= 3);
    }
    server.pool.shutdown();
}

#[tokio::test]
async fn test_connection_limit_drops_surplus_sockets() {
    let registry = registry();
    let server = start_server(&registry, 1).await;

    let admitted = connect(&server, &registry, ClientSession::default()).await;
    let pool = server.pool.clone();
    wait_until(|| pool.len() == 1).await;

    let refused = client::connect(
        &server.config,
        Arc::clone(&registry),
        client_dispatcher(),
        ClientSession::default(),
    )
    .await;
    assert!(refused.is_err());
    assert_eq!(server.pool.len(), 1);

    admitted.shutdown();
    server.pool.shutdown();
}

#[tokio::test]
async fn test_pool_shutdown_closes_clients() {
    let registry = registry();
    let server = start_server(&registry, 16).await;

    let connection = connect(&server, &registry, ClientSession::default()).await;
    let pool = server.pool.clone();
    wait_until(|| pool.len() == 1).await;

    server.pool.shutdown();
    server.pool.join().await;
    assert!(server.pool.is_empty());

    tokio::time::timeout(Duration::from_secs(5), connection.closed())
        .await
        .unwrap();
    assert!(server.pool.attach(tokio::io::duplex(64).0, None).is_err());
}

#[tokio::test]
async fn test_stalled_handshake_is_timed_out() {
    let registry = registry();
    let server = start_server_with(
        &registry,
        16,
        ConnectionConfig {
            handshake_timeout: Duration::from_millis(150),
            ..connection_config()
        },
    )
    .await;

    // a socket that never speaks the protocol
    let silent = tokio::net::TcpStream::connect(server.config.client.address.as_str())
        .await
        .unwrap();
    let pool = server.pool.clone();
    wait_until(|| pool.len() == 1).await;
    let stalled = pool.connections().remove(0);
    assert_eq!(stalled.state(), ConnectionState::Handshaking);

    wait_until(|| pool.is_empty()).await;
    assert_eq!(stalled.state(), ConnectionState::Closed);

    drop(silent);
    server.pool.shutdown();
}
