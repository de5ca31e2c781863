//! # TLS Transport Layer
//!
//! Optional TLS wrapping for connections crossing untrusted networks.
//!
//! The application handshake and argument encryption run unchanged on top of
//! the TLS stream; TLS adds server authentication and hides message framing.
//!
//! ## Responsibilities
//! - Load certificates and keys (PEM) into rustls configurations
//! - Produce a [`TlsAcceptor`] for listeners and a [`TlsConnector`] for clients
//! - Support development set-ups: self-signed certificates, insecure mode and
//!   certificate pinning

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument, warn};

use crate::config::TransportConfig;
use crate::error::{ProtocolError, Result};

/// Read every certificate from a PEM file
pub fn load_certificates<P: AsRef<Path>>(path: P) -> Result<Vec<Certificate>> {
    let file = File::open(path.as_ref())
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
    let mut reader = BufReader::new(file);
    let chain = certs(&mut reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;
    if chain.is_empty() {
        return Err(ProtocolError::TlsError("No certificates found".into()));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

/// Read the first PKCS#8 private key from a PEM file
pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKey> {
    let file = File::open(path.as_ref())
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
    let mut reader = BufReader::new(file);
    pkcs8_private_keys(&mut reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ProtocolError::TlsError("No private keys found".into()))
}

fn root_store(certificates: &[Certificate]) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in certificates {
        store
            .add(cert)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to add root certificate: {e}")))?;
    }
    Ok(store)
}

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
    /// CA bundle for verifying client certificates (mTLS)
    client_ca_path: Option<String>,
}

impl TlsServerConfig {
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
            client_ca_path: None,
        }
    }

    /// Build from the transport section; both paths must be present
    pub fn from_transport(transport: &TransportConfig) -> Result<Self> {
        match (&transport.cert_path, &transport.key_path) {
            (Some(cert), Some(key)) => Ok(Self::new(cert, key)),
            _ => Err(ProtocolError::ConfigError(
                "TLS is enabled but cert_path/key_path are not set".into(),
            )),
        }
    }

    /// Require clients to present a certificate signed by this CA bundle
    pub fn with_client_auth<S: Into<String>>(mut self, client_ca_path: S) -> Self {
        self.client_ca_path = Some(client_ca_path.into());
        self
    }

    /// Generate a self-signed certificate for `localhost` for development/testing
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        File::create(&cert_path)?.write_all(generated.cert.pem().as_bytes())?;
        File::create(&key_path)?.write_all(generated.signing_key.serialize_pem().as_bytes())?;
        debug!(cert = %cert_path.as_ref().display(), "Generated self-signed certificate");

        Ok(Self::new(cert_path, key_path))
    }

    /// Load the rustls server configuration from disk
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let chain = load_certificates(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;
        let builder = ServerConfig::builder().with_safe_defaults();

        let config = match &self.client_ca_path {
            Some(ca_path) => {
                let roots = root_store(&load_certificates(ca_path)?)?;
                let verifier = Arc::new(rustls::server::AllowAnyAuthenticatedClient::new(roots));
                debug!("mTLS enabled with client certificate verification required");
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        }
        .with_single_cert(chain, key)
        .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))?;

        Ok(config)
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

/// Accepts exactly one certificate, identified by its SHA-256 fingerprint
struct PinnedCertificate {
    fingerprint: Vec<u8>,
}

impl ServerCertVerifier for PinnedCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if TlsClientConfig::calculate_cert_hash(end_entity) == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("Pinned certificate hash mismatch".into()))
        }
    }
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    insecure: bool,
    pinned_cert_hash: Option<Vec<u8>>,
    /// Trust this PEM bundle instead of the platform roots
    root_ca_path: Option<String>,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            insecure: false,
            pinned_cert_hash: None,
            root_ca_path: None,
        }
    }

    /// Build from the transport section, falling back to `default_name` for SNI
    pub fn from_transport(transport: &TransportConfig, default_name: &str) -> Self {
        let config = Self::new(
            transport
                .server_name
                .clone()
                .unwrap_or_else(|| default_name.to_string()),
        );
        if transport.tls_insecure {
            config.insecure()
        } else {
            config
        }
    }

    /// Skip certificate verification entirely.
    ///
    /// For development and testing only. Combine with
    /// [`with_pinned_cert_hash`](Self::with_pinned_cert_hash) to still accept
    /// exactly one known certificate.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        self.insecure = true;
        self
    }

    /// Accept only the certificate with this SHA-256 fingerprint
    pub fn with_pinned_cert_hash(mut self, hash: Vec<u8>) -> Self {
        if hash.len() != 32 {
            warn!(
                "Certificate hash has unexpected length: {} (expected 32 bytes for SHA-256)",
                hash.len()
            );
        }
        self.pinned_cert_hash = Some(hash);
        self
    }

    pub fn with_root_certificate<S: Into<String>>(mut self, ca_path: S) -> Self {
        self.root_ca_path = Some(ca_path.into());
        self
    }

    /// SHA-256 fingerprint of a certificate, for pinning
    pub fn calculate_cert_hash(cert: &Certificate) -> Vec<u8> {
        Sha256::digest(&cert.0).to_vec()
    }

    /// Build the rustls client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder().with_safe_defaults();

        if let Some(hash) = &self.pinned_cert_hash {
            let verifier = Arc::new(PinnedCertificate {
                fingerprint: hash.clone(),
            });
            return Ok(builder
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth());
        }

        if self.insecure {
            return Ok(builder
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth());
        }

        let roots = match &self.root_ca_path {
            Some(path) => root_store(&load_certificates(path)?)?,
            None => {
                let native = rustls_native_certs::load_native_certs().map_err(|e| {
                    ProtocolError::TlsError(format!("Failed to load native certs: {e}"))
                })?;
                let native: Vec<Certificate> =
                    native.into_iter().map(|cert| Certificate(cert.0)).collect();
                root_store(&native)?
            }
        };

        Ok(builder
            .with_root_certificates(roots)
            .with_no_client_auth())
    }

    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.load_client_config()?)))
    }

    /// Run the TLS client handshake over an open socket
    #[instrument(skip(self, stream), fields(server_name = %self.server_name))]
    pub async fn connect(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        let connector = self.connector()?;
        connector
            .connect(self.server_name()?, stream)
            .await
            .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))
    }
}
