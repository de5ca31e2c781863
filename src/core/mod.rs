//! # Core Protocol Components
//!
//! Frame handling and the registry-driven message codec.
//!
//! ## Components
//! - **Packet**: frame format with magic bytes, version and length
//! - **Codec**: Tokio codec for framing over byte streams
//! - **Wire**: schema-driven encoding of message instances with per-argument encryption
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Length(4)] [typeId(2)] [anyEncrypted(1)] [arguments...]
//! ```
//!
//! ## Security
//! - Maximum frame payload is configurable (16MB by default)
//! - Length validation before allocation

pub mod codec;
pub mod packet;
pub mod wire;
