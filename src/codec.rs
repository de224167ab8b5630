//! # Encode/Decode Boundary
//!
//! Converts between bus [`Value`]s and runtime [`Term`]s. The bridge never
//! looks inside arguments itself; it hands them to a [`Codec`] and delivers
//! whatever comes back, or a malformed-message notice when conversion fails.
//!
//! [`TermCodec`] is the default mapping:
//!
//! | Bus value | Term |
//! |---|---|
//! | byte, int16..uint64 | `Int` |
//! | boolean | `Bool` |
//! | double | `Float` |
//! | string, object path, signature | `String` |
//! | array | `List` |
//! | struct | `Tuple` |
//! | dict | `Map` |
//! | variant | the inner value |
//! | unix fd | not representable |
//!
//! Encoding goes the other way with the widest type for each term (`Int` →
//! int64, or uint64 above `i64::MAX`).

use crate::bus::Value;
use crate::process::Term;

/// Why a value could not be converted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("Unsupported bus type: {0}")]
    UnsupportedType(&'static str),
    #[error("Containers nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("Dictionary key must be a basic type, got {0}")]
    InvalidDictKey(&'static str),
    #[error("Integer out of range: {0}")]
    IntegerOutOfRange(i128),
}

/// Conversion between bus values and runtime terms.
pub trait Codec: Send + Sync {
    fn decode(&self, value: &Value) -> Result<Term, ConversionError>;

    fn encode(&self, term: &Term) -> Result<Value, ConversionError>;

    /// Decodes a whole message body, failing on the first bad argument.
    fn decode_body(&self, body: &[Value]) -> Result<Vec<Term>, ConversionError> {
        body.iter().map(|value| self.decode(value)).collect()
    }

    fn encode_args(&self, args: &[Term]) -> Result<Vec<Value>, ConversionError> {
        args.iter().map(|term| self.encode(term)).collect()
    }
}

/// The default codec.
#[derive(Debug, Clone)]
pub struct TermCodec {
    max_depth: usize,
}

impl TermCodec {
    /// Nesting limit of the bus protocol.
    pub const DEFAULT_MAX_DEPTH: usize = 64;

    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    fn decode_at(&self, value: &Value, depth: usize) -> Result<Term, ConversionError> {
        if depth > self.max_depth {
            return Err(ConversionError::TooDeep(self.max_depth));
        }
        let term = match value {
            Value::Byte(v) => Term::Int((*v).into()),
            Value::Bool(v) => Term::Bool(*v),
            Value::Int16(v) => Term::Int((*v).into()),
            Value::UInt16(v) => Term::Int((*v).into()),
            Value::Int32(v) => Term::Int((*v).into()),
            Value::UInt32(v) => Term::Int((*v).into()),
            Value::Int64(v) => Term::Int((*v).into()),
            Value::UInt64(v) => Term::Int((*v).into()),
            Value::Double(v) => Term::Float(*v),
            Value::String(s) | Value::Signature(s) => Term::String(s.clone()),
            Value::ObjectPath(p) => Term::String(p.to_string()),
            Value::Array(items) => Term::List(self.decode_all(items, depth + 1)?),
            Value::Struct(items) => Term::Tuple(self.decode_all(items, depth + 1)?),
            Value::Dict(entries) => {
                let mut map = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    if !key.is_basic() {
                        return Err(ConversionError::InvalidDictKey(key.type_name()));
                    }
                    map.push((
                        self.decode_at(key, depth + 1)?,
                        self.decode_at(value, depth + 1)?,
                    ));
                }
                Term::Map(map)
            }
            Value::Variant(inner) => self.decode_at(inner, depth + 1)?,
            Value::UnixFd(_) => return Err(ConversionError::UnsupportedType("unix_fd")),
        };
        Ok(term)
    }

    fn decode_all(&self, values: &[Value], depth: usize) -> Result<Vec<Term>, ConversionError> {
        values
            .iter()
            .map(|value| self.decode_at(value, depth))
            .collect()
    }

    fn encode_at(&self, term: &Term, depth: usize) -> Result<Value, ConversionError> {
        if depth > self.max_depth {
            return Err(ConversionError::TooDeep(self.max_depth));
        }
        let value = match term {
            Term::Bool(b) => Value::Bool(*b),
            Term::Int(i) => {
                if let Ok(v) = i64::try_from(*i) {
                    Value::Int64(v)
                } else if let Ok(v) = u64::try_from(*i) {
                    Value::UInt64(v)
                } else {
                    return Err(ConversionError::IntegerOutOfRange(*i));
                }
            }
            Term::Float(x) => Value::Double(*x),
            Term::String(s) => Value::String(s.clone()),
            Term::List(items) => Value::Array(self.encode_all(items, depth + 1)?),
            Term::Tuple(items) => Value::Struct(self.encode_all(items, depth + 1)?),
            Term::Map(entries) => {
                let mut dict = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.encode_at(key, depth + 1)?;
                    if !key.is_basic() {
                        return Err(ConversionError::InvalidDictKey(key.type_name()));
                    }
                    dict.push((key, self.encode_at(value, depth + 1)?));
                }
                Value::Dict(dict)
            }
        };
        Ok(value)
    }

    fn encode_all(&self, terms: &[Term], depth: usize) -> Result<Vec<Value>, ConversionError> {
        terms.iter().map(|term| self.encode_at(term, depth)).collect()
    }
}

impl Default for TermCodec {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_DEPTH)
    }
}

impl Codec for TermCodec {
    fn decode(&self, value: &Value) -> Result<Term, ConversionError> {
        self.decode_at(value, 0)
    }

    fn encode(&self, term: &Term) -> Result<Value, ConversionError> {
        self.encode_at(term, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ObjectPath;

    #[test]
    fn test_decode_scalars_and_containers() {
        let codec = TermCodec::default();
        let value = Value::Struct(vec![
            Value::UInt64(u64::MAX),
            Value::ObjectPath(ObjectPath::parse("/a/b").unwrap()),
            Value::Variant(Box::new(Value::Bool(true))),
            Value::Dict(vec![(Value::from("k"), Value::Array(vec![Value::Byte(7)]))]),
        ]);

        let term = codec.decode(&value).unwrap();
        assert_eq!(
            term,
            Term::Tuple(vec![
                Term::Int(u64::MAX.into()),
                Term::from("/a/b"),
                Term::Bool(true),
                Term::Map(vec![(Term::from("k"), Term::List(vec![Term::Int(7)]))]),
            ])
        );
    }

    #[test]
    fn test_unix_fd_is_not_representable() {
        let codec = TermCodec::default();
        let body = vec![Value::from("ok"), Value::UnixFd(3)];
        assert_eq!(
            codec.decode_body(&body),
            Err(ConversionError::UnsupportedType("unix_fd"))
        );
    }

    #[test]
    fn test_nesting_limit() {
        let codec = TermCodec::new(3);
        let mut value = Value::Int32(1);
        for _ in 0..4 {
            value = Value::Array(vec![value]);
        }
        assert_eq!(codec.decode(&value), Err(ConversionError::TooDeep(3)));

        let shallow = Value::Array(vec![Value::Array(vec![Value::Int32(1)])]);
        assert!(codec.decode(&shallow).is_ok());
    }

    #[test]
    fn test_container_dict_key_rejected() {
        let codec = TermCodec::default();
        let value = Value::Dict(vec![(Value::Array(vec![]), Value::Bool(true))]);
        assert_eq!(
            codec.decode(&value),
            Err(ConversionError::InvalidDictKey("array"))
        );
    }

    #[test]
    fn test_encode_picks_wide_types() {
        let codec = TermCodec::default();
        assert_eq!(codec.encode(&Term::Int(-1)).unwrap(), Value::Int64(-1));
        assert_eq!(
            codec.encode(&Term::Int(u64::MAX.into())).unwrap(),
            Value::UInt64(u64::MAX)
        );
        assert_eq!(
            codec.encode(&Term::Int(i128::MAX)),
            Err(ConversionError::IntegerOutOfRange(i128::MAX))
        );
        assert_eq!(
            codec.encode(&Term::Map(vec![(Term::List(vec![]), Term::Int(1))])),
            Err(ConversionError::InvalidDictKey("array"))
        );
    }
}
