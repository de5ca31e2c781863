//! # Configuration Management
//!
//! Centralized configuration for servers, clients and individual connections.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - `PEERWIRE_*` environment overrides via `from_env()`
//!
//! All durations are stored in TOML as milliseconds.

use crate::error::{ProtocolError, Result};
use crate::protocol::registry::TypeRegistry;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported frame version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes opening every frame ("PWIR")
pub const MAGIC_BYTES: [u8; 4] = *b"PWIR";

/// Max allowed payload size (e.g. 16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default period of the per-connection update tick
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(20);

/// Default number of consecutive undecodable messages tolerated
pub const MAX_INVALID_MESSAGES: u32 = 10;

/// Default size of the round-trip sample ring
pub const PING_SAMPLES: usize = 16;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    /// Per-connection behaviour shared by both roles
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub schema: SchemaConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `PEERWIRE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEERWIRE_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("PEERWIRE_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Some(val) = env_parse::<usize>("PEERWIRE_MAX_CONNECTIONS")? {
            config.server.max_connections = val;
        }

        if let Some(val) = env_parse::<u64>("PEERWIRE_UPDATE_INTERVAL_MS")? {
            config.connection.update_interval = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("PEERWIRE_HANDSHAKE_TIMEOUT_MS")? {
            config.connection.handshake_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u32>("PEERWIRE_MAX_INVALID_MESSAGES")? {
            config.connection.max_invalid_messages = val;
        }

        if let Some(val) = env_parse::<u64>("PEERWIRE_PING_INTERVAL_MS")? {
            config.connection.ping_interval = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<bool>("PEERWIRE_TLS_ENABLED")? {
            config.transport.tls_enabled = val;
        }

        if let Ok(paths) = std::env::var("PEERWIRE_SCHEMA_DOCUMENTS") {
            config.schema.documents = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors.extend(self.schema.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:7000")
    pub address: String,

    /// Maximum number of concurrent connections; surplus sockets are dropped
    pub max_connections: usize,

    /// Period of the pool maintenance task
    #[serde(with = "duration_serde")]
    pub maintenance_interval: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7000"),
            max_connections: 1000,
            maintenance_interval: Duration::from_millis(500),
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:7000')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.maintenance_interval.as_millis() < 10 {
            errors.push("Maintenance interval too short (minimum: 10ms)".to_string());
        } else if self.maintenance_interval.as_secs() > 60 {
            errors.push("Maintenance interval too long (maximum: 60s)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for the TCP (and TLS) connect
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7000"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if !self.address.contains(':') {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'example.com:7000')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Behaviour of a single connection, identical for both roles
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Period of the update tick (deferred tasks, periodic tasks, flush)
    #[serde(with = "duration_serde")]
    pub update_interval: Duration,

    /// Consecutive undecodable messages before the connection is dropped
    pub max_invalid_messages: u32,

    /// Number of round-trip samples kept for the rolling average
    pub ping_samples: usize,

    /// Period of repeated pings; zero sends only the initial one
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Time allowed to reach `Secure`
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Maximum frame payload accepted or produced
    pub max_payload_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            update_interval: UPDATE_INTERVAL,
            max_invalid_messages: MAX_INVALID_MESSAGES,
            ping_samples: PING_SAMPLES,
            ping_interval: timeout::KEEPALIVE_INTERVAL,
            handshake_timeout: timeout::DEFAULT_TIMEOUT,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.update_interval.is_zero() {
            errors.push("Update interval cannot be 0".to_string());
        } else if self.update_interval.as_secs() > 10 {
            errors.push("Update interval too long (maximum: 10s)".to_string());
        }

        if self.max_invalid_messages == 0 {
            errors.push("Max invalid messages must be greater than 0".to_string());
        }

        if self.ping_samples == 0 {
            errors.push("Ping sample count must be greater than 0".to_string());
        }

        if !self.ping_interval.is_zero() && self.ping_interval < self.update_interval {
            errors.push("Ping interval cannot be shorter than the update interval".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        errors
    }
}

/// Stream layering beneath the application handshake
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TransportConfig {
    /// Wrap sockets in TLS before the key exchange
    pub tls_enabled: bool,

    /// Server certificate chain (PEM)
    pub cert_path: Option<String>,

    /// Server private key (PKCS#8 PEM)
    pub key_path: Option<String>,

    /// Name presented in the client's SNI and checked against the certificate
    pub server_name: Option<String>,

    /// Skip server certificate verification on the client side
    #[serde(default)]
    pub tls_insecure: bool,
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tls_enabled {
            if self.cert_path.is_some() != self.key_path.is_some() {
                errors.push("cert_path and key_path must be set together".to_string());
            }
            if self.tls_insecure {
                errors.push(
                    "WARNING: TLS certificate verification is disabled - not recommended for production"
                        .to_string(),
                );
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peerwire"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Message schema documents loaded at start-up
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SchemaConfig {
    /// Paths of JSON schema documents, merged in order
    #[serde(default)]
    pub documents: Vec<String>,
}

impl SchemaConfig {
    pub fn validate(&self) -> Vec<String> {
        self.documents
            .iter()
            .filter(|path| !Path::new(path).is_file())
            .map(|path| format!("Schema document not found: {path}"))
            .collect()
    }

    /// Build a registry with the built-in types plus every listed document
    pub fn load_registry(&self) -> Result<TypeRegistry> {
        let mut registry = TypeRegistry::new();
        for path in &self.documents {
            registry.register_file(path)?;
        }
        Ok(registry)
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
