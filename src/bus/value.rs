//! Bus wire values.
//!
//! [`Value`] is the transport's view of a message argument. It is what the
//! [`codec`](crate::codec) converts to and from runtime terms.

use super::path::ObjectPath;

/// A single typed bus value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(String),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Variant(Box<Value>),
    /// A file descriptor passed over the bus. Only meaningful inside the
    /// receiving OS process.
    UnixFd(i32),
}

impl Value {
    /// Basic (non-container) values are the only legal dictionary keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Value::Array(_) | Value::Struct(_) | Value::Dict(_) | Value::Variant(_)
        )
    }

    /// Short type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Bool(_) => "boolean",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::ObjectPath(_) => "object_path",
            Value::Signature(_) => "signature",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Dict(_) => "dict",
            Value::Variant(_) => "variant",
            Value::UnixFd(_) => "unix_fd",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Signature(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::UInt32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<ObjectPath> for Value {
    fn from(value: ObjectPath) -> Self {
        Value::ObjectPath(value)
    }
}
