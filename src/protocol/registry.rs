//! # Type Registry
//!
//! Holds every message type known to a process, indexed by id and by name.
//!
//! A registry is built once at start-up from one or more schema documents and is
//! read-only afterwards; connections share it through an `Arc` without locking.
//! Independent registries can coexist (one per test, one per application).
//!
//! Negative ids are reserved for the built-in control messages that every
//! registry carries (see [`builtin`]).

use crate::error::{ProtocolError, Result};
use crate::protocol::message::MessageInstance;
use crate::protocol::schema::{ArgumentSpec, MessageTypeSpec, SchemaDocument, ValueType};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Reserved control message types
pub mod builtin {
    /// Notice sent back for undecodable or unhandled messages
    pub const INVALID_MESSAGE: &str = "InvalidMessage";
    pub const INVALID_MESSAGE_ID: i16 = -1;
    /// Handshake step one: `key: byte[]`
    pub const PUBLIC_KEY: &str = "PublicKey";
    pub const PUBLIC_KEY_ID: i16 = -2;
    /// Handshake step two: `sealedKey: byte[]`
    pub const SESSION_KEY: &str = "SessionKey";
    pub const SESSION_KEY_ID: i16 = -3;
    /// Latency probe: `sentAt: int64`
    pub const PING: &str = "Ping";
    pub const PING_ID: i16 = -4;
    pub const PONG: &str = "Pong";
    pub const PONG_ID: i16 = -5;

    pub const ARG_MESSAGE_NAME: &str = "messageName";
    pub const ARG_MESSAGE_ID: &str = "messageId";
    pub const ARG_KEY: &str = "key";
    pub const ARG_SEALED_KEY: &str = "sealedKey";
    pub const ARG_SENT_AT: &str = "sentAt";
}

/// Process-wide catalogue of message types
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    by_id: HashMap<i16, Arc<MessageTypeSpec>>,
    by_name: HashMap<String, Arc<MessageTypeSpec>>,
    disabled: HashSet<String>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a registry holding only the built-in control messages
    pub fn new() -> Self {
        let mut registry = Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            disabled: HashSet::new(),
        };

        let builtins = [
            MessageTypeSpec::new(
                builtin::INVALID_MESSAGE_ID,
                builtin::INVALID_MESSAGE,
                vec![
                    ArgumentSpec::new(builtin::ARG_MESSAGE_NAME, ValueType::String),
                    ArgumentSpec::new(builtin::ARG_MESSAGE_ID, ValueType::Int16),
                ],
            ),
            MessageTypeSpec::new(
                builtin::PUBLIC_KEY_ID,
                builtin::PUBLIC_KEY,
                vec![ArgumentSpec::new(builtin::ARG_KEY, ValueType::Bytes)],
            ),
            MessageTypeSpec::new(
                builtin::SESSION_KEY_ID,
                builtin::SESSION_KEY,
                vec![ArgumentSpec::new(builtin::ARG_SEALED_KEY, ValueType::Bytes)],
            ),
            MessageTypeSpec::new(
                builtin::PING_ID,
                builtin::PING,
                vec![ArgumentSpec::new(builtin::ARG_SENT_AT, ValueType::Int64)],
            ),
            MessageTypeSpec::new(
                builtin::PONG_ID,
                builtin::PONG,
                vec![ArgumentSpec::new(builtin::ARG_SENT_AT, ValueType::Int64)],
            ),
        ];

        for spec in builtins {
            registry.insert(spec);
        }
        registry
    }

    fn insert(&mut self, spec: MessageTypeSpec) {
        let spec = Arc::new(spec);
        self.by_name.insert(spec.name.clone(), spec.clone());
        self.by_id.insert(spec.id, spec);
    }

    /// Parse a JSON schema document and merge its types.
    ///
    /// Returns the number of types added. The document is validated as a whole
    /// first; on error nothing from it is merged.
    pub fn register(&mut self, source: &str) -> Result<usize> {
        let document = SchemaDocument::from_json(source)?;
        self.register_document(document)
    }

    /// Read and register a JSON schema document from disk
    pub fn register_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let source = std::fs::read_to_string(&path).map_err(|e| {
            ProtocolError::SchemaError(format!(
                "Failed to read schema {}: {e}",
                path.as_ref().display()
            ))
        })?;
        self.register(&source)
    }

    /// Merge an already parsed schema document
    #[instrument(skip(self, document), fields(types = document.messages.len()))]
    pub fn register_document(&mut self, document: SchemaDocument) -> Result<usize> {
        self.validate_document(&document)?;

        let added = document.messages.len();
        for spec in document.messages {
            debug!(id = spec.id, name = %spec.name, "Registered message type");
            self.insert(spec);
        }
        self.disabled.extend(document.disabled);
        Ok(added)
    }

    fn validate_document(&self, document: &SchemaDocument) -> Result<()> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();

        for spec in &document.messages {
            if spec.name.is_empty() {
                return Err(ProtocolError::SchemaError(format!(
                    "Message type {} has an empty name",
                    spec.id
                )));
            }
            if spec.id < 0 {
                return Err(ProtocolError::SchemaError(format!(
                    "Message type {} uses reserved id {}",
                    spec.name, spec.id
                )));
            }
            if self.by_id.contains_key(&spec.id) || !ids.insert(spec.id) {
                return Err(ProtocolError::SchemaError(format!(
                    "Duplicate message type id {} ({})",
                    spec.id, spec.name
                )));
            }
            if self.by_name.contains_key(&spec.name) || !names.insert(spec.name.as_str()) {
                return Err(ProtocolError::SchemaError(format!(
                    "Duplicate message type name {}",
                    spec.name
                )));
            }

            let mut arguments = HashSet::new();
            for argument in &spec.arguments {
                if argument.name.is_empty() {
                    return Err(ProtocolError::SchemaError(format!(
                        "Message type {} has an unnamed argument",
                        spec.name
                    )));
                }
                if !arguments.insert(argument.name.as_str()) {
                    return Err(ProtocolError::SchemaError(format!(
                        "Message type {} declares argument {} twice",
                        spec.name, argument.name
                    )));
                }
            }
        }

        if let Some(name) = document.disabled.iter().find(|name| name.is_empty()) {
            return Err(ProtocolError::SchemaError(format!(
                "Disabled list contains an empty name: {name:?}"
            )));
        }

        Ok(())
    }

    pub fn lookup_id(&self, id: i16) -> Option<Arc<MessageTypeSpec>> {
        self.by_id.get(&id).cloned()
    }

    pub fn lookup_name(&self, name: &str) -> Option<Arc<MessageTypeSpec>> {
        self.by_name.get(name).cloned()
    }

    /// Start an empty instance of the named type
    pub fn instance(&self, name: &str) -> Result<MessageInstance> {
        self.lookup_name(name)
            .map(MessageInstance::new)
            .ok_or_else(|| ProtocolError::UnknownMessage(name.to_string()))
    }

    /// Whether schema documents marked this message's handler as disabled
    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.contains(name)
    }

    pub fn disabled(&self) -> impl Iterator<Item = &str> {
        self.disabled.iter().map(String::as_str)
    }

    /// Number of registered types, built-ins included
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<MessageTypeSpec>> {
        self.by_id.values()
    }
}
