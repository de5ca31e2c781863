//! # Protocol Layer
//!
//! Message schemas, the type registry, message instances, the key-exchange
//! handshake and the two-phase handler dispatcher.
//!
//! ## Components
//! - **Schema / Registry**: typed message contracts loaded once at start-up
//! - **Message**: schema-checked argument bags ready for transport
//! - **Handshake**: X25519 key pairs and sealed session key transport
//! - **Dispatcher**: message name to handler table, immediate and deferred phases

pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod registry;
pub mod schema;
