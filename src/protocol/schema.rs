//! Message type schemas.
//!
//! A schema document declares message types as an id, a name and an ordered
//! list of typed arguments. Argument order is the canonical wire order.
//!
//! ```json
//! {
//!   "messages": [
//!     { "id": 1, "name": "Echo", "arguments": [ { "name": "text", "type": "string" } ] },
//!     { "id": 2, "name": "Login", "arguments": [
//!         { "name": "user", "type": "string" },
//!         { "name": "password", "type": "string", "encrypt": true }
//!     ] }
//!   ],
//!   "disabled": ["Teleport"]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire type of a single argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(rename = "int16")]
    Int16,
    #[serde(rename = "int32")]
    Int32,
    #[serde(rename = "int64")]
    Int64,
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "float64")]
    Float64,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "byte")]
    Byte,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "byte[]")]
    Bytes,
    #[serde(rename = "string[]")]
    Strings,
}

impl ValueType {
    /// Schema spelling of the type
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Int16 => "int16",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::Float32 => "float32",
            ValueType::Float64 => "float64",
            ValueType::Bool => "bool",
            ValueType::Byte => "byte",
            ValueType::String => "string",
            ValueType::Bytes => "byte[]",
            ValueType::Strings => "string[]",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One declared argument of a message type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Whether the argument payload passes through the session cipher
    #[serde(default, rename = "encrypt")]
    pub must_encrypt: bool,
}

impl ArgumentSpec {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            must_encrypt: false,
        }
    }

    pub fn encrypted(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            must_encrypt: true,
        }
    }
}

/// The contract for one kind of wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTypeSpec {
    pub id: i16,
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,
}

impl MessageTypeSpec {
    pub fn new(id: i16, name: impl Into<String>, arguments: Vec<ArgumentSpec>) -> Self {
        Self {
            id,
            name: name.into(),
            arguments,
        }
    }

    /// Whether any argument is flagged for encryption
    pub fn has_encrypted_arguments(&self) -> bool {
        self.arguments.iter().any(|arg| arg.must_encrypt)
    }

    /// Position of an argument in wire order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.arguments.iter().position(|arg| arg.name == name)
    }
}

/// A schema document as loaded from disk or embedded in an application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub messages: Vec<MessageTypeSpec>,
    /// Message names whose handlers must fail loudly if invoked
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl SchemaDocument {
    /// Parse a JSON schema document
    pub fn from_json(source: &str) -> crate::error::Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| crate::error::ProtocolError::SchemaError(format!("Malformed schema: {e}")))
    }
}
