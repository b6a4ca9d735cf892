//! The dynamic value model held inside pointers.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::id::PointerId;

/// A dynamically typed value. Compound values own their children except
/// where a child is itself pointerized, in which case it appears as a
/// [`Value::Ref`] and lives in its own pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    BigInt(i128),
    Decimal(f64),
    Text(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    /// Reference to another pointer.
    Ref(PointerId),
}

/// Discriminant of a [`Value`], used for shape checks and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    BigInt,
    Decimal,
    Text,
    List,
    Map,
    Ref,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::BigInt(_) => ValueKind::BigInt,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::Text(_) => ValueKind::Text,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Ref(_) => ValueKind::Ref,
        }
    }

    /// Primitive values are copied on read; compound values are shared
    /// through their owning pointer.
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Map(_))
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        match (self, key) {
            (Value::Map(map), Key::Text(name)) => map.get(name.as_str()),
            (Value::List(list), Key::Index(index)) => list.get(*index),
            _ => None,
        }
    }

    /// Number of direct children of a compound value.
    pub fn len(&self) -> usize {
        match self {
            Value::List(list) => list.len(),
            Value::Map(map) => map.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a canonical byte encoding of this value, used for
    /// dependency hashing. Map entries are encoded in insertion order,
    /// which the runtime keeps deterministic.
    pub fn canonical_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0x00),
            Value::Bool(b) => {
                out.push(0x01);
                out.push(*b as u8);
            }
            Value::Int(i) => {
                out.push(0x02);
                out.extend_from_slice(&i.to_be_bytes());
            }
            Value::BigInt(i) => {
                out.push(0x03);
                out.extend_from_slice(&i.to_be_bytes());
            }
            Value::Decimal(d) => {
                out.push(0x04);
                out.extend_from_slice(&d.to_bits().to_be_bytes());
            }
            Value::Text(s) => {
                out.push(0x05);
                out.extend_from_slice(&(s.len() as u64).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::List(items) => {
                out.push(0x06);
                out.extend_from_slice(&(items.len() as u64).to_be_bytes());
                for item in items {
                    item.canonical_bytes(out);
                }
            }
            Value::Map(map) => {
                out.push(0x07);
                out.extend_from_slice(&(map.len() as u64).to_be_bytes());
                for (key, value) in map {
                    out.extend_from_slice(&(key.len() as u64).to_be_bytes());
                    out.extend_from_slice(key.as_bytes());
                    value.canonical_bytes(out);
                }
            }
            Value::Ref(id) => {
                out.push(0x08);
                out.extend_from_slice(id.as_bytes());
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i128> for Value {
    fn from(v: i128) -> Value {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}

impl From<PointerId> for Value {
    fn from(v: PointerId) -> Value {
        Value::Ref(v)
    }
}

/// Property key inside a compound value: a map field or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Text(String),
    Index(usize),
}

impl From<&str> for Key {
    fn from(key: &str) -> Key {
        Key::Text(key.to_string())
    }
}

impl From<String> for Key {
    fn from(key: String) -> Key {
        Key::Text(key)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Key {
        Key::Index(index)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Text(name) => write!(f, "{name}"),
            Key::Index(index) => write!(f, "{index}"),
        }
    }
}
