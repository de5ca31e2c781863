//! Message instances: one schema-checked, named bag of argument values.
//!
//! Values are type-checked as they are set, so an instance can only ever hold
//! what its [`MessageTypeSpec`] allows. An instance is *sendable* once every
//! declared argument has a value.
//!
//! ```rust
//! use peerwire::protocol::registry::TypeRegistry;
//!
//! let mut registry = TypeRegistry::new();
//! registry
//!     .register(r#"{"messages":[{"id":1,"name":"Echo","arguments":[{"name":"text","type":"string"}]}]}"#)
//!     .unwrap();
//!
//! let echo = registry.instance("Echo").unwrap().with("text", "abc").unwrap();
//! assert!(echo.is_sendable());
//! assert_eq!(echo.string("text").unwrap(), "abc");
//! ```

use crate::error::{ProtocolError, Result};
use crate::protocol::schema::{MessageTypeSpec, ValueType};
use std::fmt;
use std::sync::Arc;

/// A single argument value
#[derive(Debug, Clone)]
pub enum Value {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Byte(u8),
    String(String),
    Bytes(Vec<u8>),
    Strings(Vec<String>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int16(_) => ValueType::Int16,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::Float32(_) => ValueType::Float32,
            Value::Float64(_) => ValueType::Float64,
            Value::Bool(_) => ValueType::Bool,
            Value::Byte(_) => ValueType::Byte,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Strings(_) => ValueType::Strings,
        }
    }
}

// Floats compare by bit pattern so every decoded value equals its source.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Strings(a), Value::Strings(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(value.into())
            }
        })*
    };
}

value_from! {
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    bool => Bool,
    u8 => Byte,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
    &[u8] => Bytes,
    Vec<String> => Strings,
}

impl From<Vec<&str>> for Value {
    fn from(value: Vec<&str>) -> Self {
        Value::Strings(value.into_iter().map(str::to_string).collect())
    }
}

/// One concrete occurrence of a message type
#[derive(Debug, Clone)]
pub struct MessageInstance {
    spec: Arc<MessageTypeSpec>,
    values: Vec<Option<Value>>,
}

impl MessageInstance {
    pub fn new(spec: Arc<MessageTypeSpec>) -> Self {
        let values = vec![None; spec.arguments.len()];
        Self { spec, values }
    }

    pub fn spec(&self) -> &Arc<MessageTypeSpec> {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn type_id(&self) -> i16 {
        self.spec.id
    }

    /// Set a named argument, checking it against the schema
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let position = self.spec.position(name).ok_or_else(|| {
            ProtocolError::InvalidArgument(format!(
                "{} has no argument named {name}",
                self.spec.name
            ))
        })?;
        self.set_at(position, value.into())
    }

    /// Builder form of [`MessageInstance::set`]
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    pub(crate) fn set_at(&mut self, position: usize, value: Value) -> Result<()> {
        let argument = self.spec.arguments.get(position).ok_or_else(|| {
            ProtocolError::InvalidArgument(format!(
                "{} has no argument at position {position}",
                self.spec.name
            ))
        })?;
        if argument.value_type != value.value_type() {
            return Err(ProtocolError::InvalidArgument(format!(
                "{}.{} expects {}, got {}",
                self.spec.name,
                argument.name,
                argument.value_type,
                value.value_type()
            )));
        }
        self.values[position] = Some(value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.spec
            .position(name)
            .and_then(|position| self.values[position].as_ref())
    }

    /// Every declared argument has a value
    pub fn is_sendable(&self) -> bool {
        self.values.iter().all(Option::is_some)
    }

    /// Names of declared arguments without a value
    pub fn missing(&self) -> Vec<String> {
        self.spec
            .arguments
            .iter()
            .zip(&self.values)
            .filter(|(_, value)| value.is_none())
            .map(|(argument, _)| argument.name.clone())
            .collect()
    }

    pub fn ensure_complete(&self) -> Result<()> {
        if self.is_sendable() {
            Ok(())
        } else {
            Err(ProtocolError::IncompleteMessage {
                message: self.spec.name.clone(),
                missing: self.missing(),
            })
        }
    }

    /// Argument values in wire order. Fails on an incomplete instance.
    pub fn arguments(&self) -> Result<Vec<&Value>> {
        self.ensure_complete()?;
        Ok(self.values.iter().flatten().collect())
    }

    fn required(&self, name: &str) -> Result<&Value> {
        self.get(name).ok_or_else(|| {
            ProtocolError::InvalidArgument(format!("{}.{name} has no value", self.spec.name))
        })
    }

    fn mismatch(&self, name: &str, expected: ValueType) -> ProtocolError {
        ProtocolError::InvalidArgument(format!(
            "{}.{name} is not of type {expected}",
            self.spec.name
        ))
    }

    pub fn int16(&self, name: &str) -> Result<i16> {
        match self.required(name)? {
            Value::Int16(v) => Ok(*v),
            _ => Err(self.mismatch(name, ValueType::Int16)),
        }
    }

    pub fn int32(&self, name: &str) -> Result<i32> {
        match self.required(name)? {
            Value::Int32(v) => Ok(*v),
            _ => Err(self.mismatch(name, ValueType::Int32)),
        }
    }

    pub fn int64(&self, name: &str) -> Result<i64> {
        match self.required(name)? {
            Value::Int64(v) => Ok(*v),
            _ => Err(self.mismatch(name, ValueType::Int64)),
        }
    }

    pub fn float32(&self, name: &str) -> Result<f32> {
        match self.required(name)? {
            Value::Float32(v) => Ok(*v),
            _ => Err(self.mismatch(name, ValueType::Float32)),
        }
    }

    pub fn float64(&self, name: &str) -> Result<f64> {
        match self.required(name)? {
            Value::Float64(v) => Ok(*v),
            _ => Err(self.mismatch(name, ValueType::Float64)),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        match self.required(name)? {
            Value::Bool(v) => Ok(*v),
            _ => Err(self.mismatch(name, ValueType::Bool)),
        }
    }

    pub fn byte(&self, name: &str) -> Result<u8> {
        match self.required(name)? {
            Value::Byte(v) => Ok(*v),
            _ => Err(self.mismatch(name, ValueType::Byte)),
        }
    }

    pub fn string(&self, name: &str) -> Result<&str> {
        match self.required(name)? {
            Value::String(v) => Ok(v),
            _ => Err(self.mismatch(name, ValueType::String)),
        }
    }

    pub fn bytes(&self, name: &str) -> Result<&[u8]> {
        match self.required(name)? {
            Value::Bytes(v) => Ok(v),
            _ => Err(self.mismatch(name, ValueType::Bytes)),
        }
    }

    pub fn strings(&self, name: &str) -> Result<&[String]> {
        match self.required(name)? {
            Value::Strings(v) => Ok(v),
            _ => Err(self.mismatch(name, ValueType::Strings)),
        }
    }
}

impl PartialEq for MessageInstance {
    fn eq(&self, other: &Self) -> bool {
        self.spec.id == other.spec.id
            && self.spec.name == other.spec.name
            && self.values == other.values
    }
}

impl fmt::Display for MessageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.spec.name, self.spec.id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::schema::ArgumentSpec;

    fn login() -> MessageInstance {
        MessageInstance::new(Arc::new(MessageTypeSpec::new(
            7,
            "Login",
            vec![
                ArgumentSpec::new("user", ValueType::String),
                ArgumentSpec::encrypted("password", ValueType::String),
                ArgumentSpec::new("version", ValueType::Int32),
            ],
        )))
    }

    #[test]
    fn incomplete_instance_reports_missing_arguments() {
        let msg = login().with("user", "ada").unwrap();
        assert!(!msg.is_sendable());
        assert_eq!(msg.missing(), vec!["password", "version"]);

        match msg.arguments() {
            Err(ProtocolError::IncompleteMessage { message, missing }) => {
                assert_eq!(message, "Login");
                assert_eq!(missing.len(), 2);
            }
            other => panic!("expected IncompleteMessage, got {other:?}"),
        }
    }

    #[test]
    fn complete_instance_yields_wire_order() {
        let msg = login()
            .with("version", 3)
            .unwrap()
            .with("password", "secret")
            .unwrap()
            .with("user", "ada")
            .unwrap();

        let args = msg.arguments().unwrap();
        assert_eq!(args[0], &Value::String("ada".into()));
        assert_eq!(args[2], &Value::Int32(3));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut msg = login();
        let err = msg.set("version", "three").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgument(_)));
        assert!(msg.get("version").is_none());
    }

    #[test]
    fn unknown_argument_is_rejected() {
        let mut msg = login();
        assert!(matches!(
            msg.set("token", 1i64),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn typed_getters_check_types() {
        let msg = login().with("version", 9).unwrap();
        assert_eq!(msg.int32("version").unwrap(), 9);
        assert!(msg.int64("version").is_err());
        assert!(msg.string("user").is_err());
    }

    #[test]
    fn nan_values_compare_equal_to_themselves() {
        assert_eq!(Value::Float64(f64::NAN), Value::Float64(f64::NAN));
        assert_ne!(Value::Float32(0.0), Value::Float32(-0.0));
    }
}
