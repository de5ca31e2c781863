//! # peerwire
//!
//! Typed binary messaging for real-time client/server applications.
//!
//! Both peers load the same message schemas into a [`TypeRegistry`]. A
//! [`Connection`] exchanges X25519 public keys, agrees on a session key, and from
//! then on encrypts every argument the schema flags. Received messages are routed
//! by name through a [`Dispatcher`]: a handler's immediate phase runs on the
//! reader task, its deferred phase runs later on the connection's update task
//! with mutable access to the per-connection session state.
//!
//! ## Layers
//! - **core**: frame codec and schema-driven wire codec
//! - **protocol**: schemas, registry, messages, handshake, dispatcher
//! - **service**: connections, server pool and listener, client
//! - **transport**: optional TLS beneath the application handshake
//! - **utils**: crypto, latency tracking, logging, metrics, timeouts
//!
//! ## Example
//! ```no_run
//! use peerwire::{client, Dispatcher, NetworkConfig, TypeRegistry};
//! use std::sync::Arc;
//!
//! # async fn run() -> peerwire::Result<()> {
//! let mut registry = TypeRegistry::new();
//! registry.register(
//!     r#"{"messages":[{"id":1,"name":"Echo","arguments":[{"name":"text","type":"string"}]}]}"#,
//! )?;
//! let registry = Arc::new(registry);
//!
//! let dispatcher = Arc::new(Dispatcher::<Vec<String>>::new());
//! dispatcher.on("Echo", |message, log: &mut Vec<String>, _| {
//!     log.push(message.string("text")?.to_string());
//!     Ok(())
//! })?;
//!
//! let connection = client::connect(&NetworkConfig::default(), registry.clone(), dispatcher, Vec::new()).await?;
//! connection.queue_message(registry.instance("Echo")?.with("text", "hello")?)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
pub use protocol::dispatcher::{Dispatcher, Executable, HandlerFactory};
pub use protocol::handshake::{HandshakeState, Role};
pub use protocol::message::{MessageInstance, Value};
pub use protocol::registry::TypeRegistry;
pub use protocol::schema::{ArgumentSpec, MessageTypeSpec, SchemaDocument, ValueType};
pub use service::client;
pub use service::connection::{Connection, ConnectionHandle, ConnectionState};
pub use service::listener::Listener;
pub use service::pool::ConnectionPool;
