//! # Utility Modules
//!
//! Supporting utilities for cryptography, latency tracking, logging, metrics and timing.
//!
//! ## Components
//! - **Crypto**: XChaCha20-Poly1305 field encryption and the no-key sentinel
//! - **Ping**: bounded ring of round-trip samples
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters
//! - **Timeout**: deadline wrappers, retry backoff and one-shot request/response rendezvous
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Memory zeroing for key material (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod ping;
pub mod timeout;

pub use ping::PingTracker;
pub use timeout::{pending, Completer, ExponentialBackoff, Pending};
