//! Field values of a module's state
//!
//! How the diff engine treats a field depends on its variant. Scalars and
//! strings are compared whole, `Bytes` fields are split into fixed-size
//! regions so two writers touching different parts of a buffer do not
//! collide, lists can be merged by appending unseen items, and maps nest
//! further fields under a dotted path.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value of one module-state field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// Field present without a value
    #[default]
    Null,
    Bool(bool),
    /// Sizes, handles and counters
    Int(i64),
    Float(f64),
    String(String),
    /// Opaque buffer, diffed region by region
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Nested fields
    Map(ValueMap),
}

/// Fields keyed by name, in insertion order so encodings are deterministic
pub type ValueMap = IndexMap<String, Value>;

impl Value {
    /// A `Bytes` field holding `data`
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        if let Value::Int(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    /// Numeric view of an `Int` or `Float` field
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Float(f) => Some(f),
            Value::Int(i) => Some(i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Value::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        if let Value::Bytes(b) = self {
            Some(b)
        } else {
            None
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        if let Value::Map(map) = self {
            Some(map)
        } else {
            None
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Variant name used in diff and path errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// A field whose variant changes is a structural change, not an edit
    pub fn same_type(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn joined<T>(
            f: &mut fmt::Formatter<'_>,
            items: impl Iterator<Item = T>,
            mut each: impl FnMut(&mut fmt::Formatter<'_>, T) -> fmt::Result,
        ) -> fmt::Result {
            for (i, item) in items.enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                each(f, item)?;
            }
            Ok(())
        }

        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                f.write_str("[")?;
                joined(f, items.iter(), |f, v| write!(f, "{}", v))?;
                f.write_str("]")
            }
            Value::Map(fields) => {
                f.write_str("{")?;
                joined(f, fields.iter(), |f, (k, v)| write!(f, "{}: {}", k, v))?;
                f.write_str("}")
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => |$v:ident| $make:expr),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from($v: $ty) -> Self {
                    $make
                }
            }
        )*
    };
}

value_from! {
    bool => |b| Value::Bool(b),
    i64 => |i| Value::Int(i),
    i32 => |i| Value::Int(i64::from(i)),
    u32 => |i| Value::Int(i64::from(i)),
    f64 => |x| Value::Float(x),
    String => |s| Value::String(s),
    &str => |s| Value::String(s.to_owned()),
    ValueMap => |fields| Value::Map(fields),
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
