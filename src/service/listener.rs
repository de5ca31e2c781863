//! TCP listener with optional TLS layering.

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::transport::tls::TlsServerConfig;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Bound socket the pool accepts from
pub struct Listener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        info!(address = %addr, "Listener bound");
        Ok(Self { inner, tls: None })
    }

    /// Bind the configured server address, wrapping sockets in TLS when enabled
    pub async fn from_config(config: &NetworkConfig) -> Result<Self> {
        let listener = Self::bind(&config.server.address).await?;
        if config.transport.tls_enabled {
            let acceptor = TlsServerConfig::from_transport(&config.transport)?.acceptor()?;
            Ok(listener.with_tls(acceptor))
        } else {
            Ok(listener)
        }
    }

    /// Complete a TLS handshake on every accepted socket before the key exchange
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn tls(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }
}
