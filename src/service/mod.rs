//! # Service Layer
//!
//! Long-lived connection machinery built on the protocol layer.
//!
//! ## Components
//! - **Connection**: reader and update tasks, outbound queue, handshake driving
//! - **Pool / Listener**: server-side accept loop and maintenance
//! - **Client**: dial, optional TLS, wait for the session key

pub mod client;
pub mod connection;
pub mod listener;
pub mod pool;
