use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::controls::ControlValue;
use crate::hashing::{Frame, HashError, StableHash, StableHasher};

/// A value a page script computes with.
///
/// Everything except [`Value::Handle`] round-trips through JSON, which is what
/// data caches and session state store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    #[serde(skip)]
    Handle(Arc<Handle>),
}

/// An opaque live object, such as a connection. Handles compare by identity.
#[derive(Debug, PartialEq, Eq)]
pub struct Handle {
    pub kind: &'static str,
    pub name: String,
    pub id: u64,
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl Handle {
    pub fn open(kind: &'static str, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Handle(_) => "handle",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(value) => *value,
            Self::Int(value) => *value != 0,
            Self::Float(value) => *value != 0.0,
            Self::Str(value) => !value.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Handle(_) => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Quoted form used inside lists and error messages.
    pub fn repr(&self) -> String {
        match self {
            Self::Str(text) => format!("{text:?}"),
            other => other.to_string(),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) if value.is_finite() && value.fract() == 0.0 => write!(f, "{value:.1}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Str(text) => write!(f, "{text}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "]")
            }
            Self::Handle(handle) => write!(f, "<{} {:?}>", handle.kind, handle.name),
        }
    }
}

impl From<ControlValue> for Value {
    fn from(value: ControlValue) -> Self {
        match value {
            ControlValue::Bool(value) => Self::Bool(value),
            ControlValue::Int(value) => Self::Int(value),
            ControlValue::Float(value) => Self::Float(value),
            ControlValue::Text(value) => Self::Str(value),
        }
    }
}

impl StableHash for Value {
    fn stable_hash(&self, hasher: &mut StableHasher<'_>) -> Result<(), HashError> {
        match self {
            Self::None => hasher.write_tag("none"),
            Self::Bool(value) => {
                hasher.write_tag("bool");
                hasher.write_u64(*value as u64);
            }
            Self::Int(value) => {
                hasher.write_tag("int");
                hasher.write_i64(*value);
            }
            Self::Float(value) => {
                hasher.write_tag("float");
                hasher.write_f64(*value);
            }
            Self::Str(text) => {
                hasher.write_tag("str");
                hasher.write_str(text);
            }
            Self::List(items) => {
                hasher.write_tag("list");
                hasher.write_u64(items.len() as u64);
                for (index, item) in items.iter().enumerate() {
                    hasher.nested(Frame::Index(index), |h| item.stable_hash(h))?;
                }
            }
            Self::Handle(handle) => {
                return Err(hasher.unhashable(
                    handle.kind,
                    self.to_string(),
                    "live handles have no stable content",
                ))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::fingerprint;

    #[test]
    fn display_and_truthiness() {
        let list = Value::List(vec![Value::Int(1), Value::Str("a".to_string()), Value::Float(2.0)]);
        assert_eq!(list.to_string(), "[1, \"a\", 2.0]");
        assert!(list.is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::None.is_truthy());
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
    }

    #[test]
    fn json_round_trip_keeps_ints_and_floats_apart() {
        let value = Value::List(vec![Value::Int(3), Value::Float(3.5), Value::None, Value::Bool(true)]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, "[3,3.5,null,true]");
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn handles_do_not_serialize_or_hash() {
        let handle = Value::Handle(Arc::new(Handle::open("connection", "db")));
        assert!(serde_json::to_string(&handle).is_err());
        let error = fingerprint(&Value::List(vec![Value::Int(1), handle])).unwrap_err();
        assert!(error.render_stack().contains("[1]"));
    }

    #[test]
    fn equal_values_hash_equal() {
        let a = Value::List(vec![Value::Int(1), Value::Str("x".to_string())]);
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&a.clone()).unwrap());
        assert_ne!(
            fingerprint(&Value::Int(1)).unwrap(),
            fingerprint(&Value::Float(1.0)).unwrap()
        );
    }
}
