//! Client-side connection set-up.
//!
//! Dials the server, optionally completes TLS, starts an initiator-role
//! [`Connection`] and waits for the session key before handing it back.

use crate::config::{ConnectionConfig, NetworkConfig};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::Role;
use crate::protocol::registry::TypeRegistry;
use crate::service::connection::Connection;
use crate::transport::tls::TlsClientConfig;
use crate::utils::timeout::with_timeout_error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{info, instrument, warn};

/// Dial `config.client.address` and return a secured connection.
///
/// TLS is layered underneath when `config.transport.tls_enabled` is set.
#[instrument(skip_all, fields(address = %config.client.address, tls = config.transport.tls_enabled))]
pub async fn connect<S: Send + 'static>(
    config: &NetworkConfig,
    registry: Arc<TypeRegistry>,
    dispatcher: Arc<Dispatcher<S>>,
    session: S,
) -> Result<Connection<S>> {
    let address = config.client.address.as_str();
    let stream = with_timeout_error(
        async { TcpStream::connect(address).await.map_err(ProtocolError::from) },
        config.client.connection_timeout,
    )
    .await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr().ok();

    if config.transport.tls_enabled {
        let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
        let tls = TlsClientConfig::from_transport(&config.transport, host);
        let stream = tls.connect(stream).await?;
        connect_stream(stream, peer, &config.connection, registry, dispatcher, session).await
    } else {
        connect_stream(stream, peer, &config.connection, registry, dispatcher, session).await
    }
}

/// Start an initiator connection over an established stream and wait until it
/// is secure. On timeout the connection is shut down and `Timeout` returned.
pub async fn connect_stream<S, T>(
    stream: T,
    peer: Option<SocketAddr>,
    config: &ConnectionConfig,
    registry: Arc<TypeRegistry>,
    dispatcher: Arc<Dispatcher<S>>,
    session: S,
) -> Result<Connection<S>>
where
    S: Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let connection = Connection::new(
        Role::Initiator,
        peer,
        registry,
        dispatcher,
        config.clone(),
        session,
    )?;
    connection.start(stream)?;

    match connection.wait_secure(config.handshake_timeout).await {
        Ok(()) => {
            info!(connection = connection.id(), "Connected");
            Ok(connection)
        }
        Err(e) => {
            warn!(connection = connection.id(), error = %e, "Handshake did not complete");
            connection.shutdown();
            Err(e)
        }
    }
}
