//! # Transport Layer
//!
//! Stream layering beneath the application handshake. Connections accept any
//! `AsyncRead + AsyncWrite` stream, so plain TCP and TLS share one code path.

pub mod tls;
