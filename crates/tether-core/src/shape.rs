//! Structural shapes used to validate property writes.
//!
//! A pointer may declare a shape for its value. The mutation gateway
//! checks every incoming write against the shape before touching the
//! value, so remote updates cannot corrupt a structured pointer.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::PointerError;
use crate::value::{Key, Value};

/// Structural description of a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// Matches anything; the default for untyped pointers.
    Any,
    Bool,
    Integer,
    /// Arbitrary-precision integer slot. Plain integers written into a
    /// `BigInteger` slot are widened rather than rejected.
    BigInteger,
    Decimal,
    Text,
    List(Box<Shape>),
    Record {
        properties: IndexMap<String, Shape>,
        /// Open records accept keys beyond the declared properties.
        open: bool,
    },
    Reference,
}

impl Default for Shape {
    fn default() -> Shape {
        Shape::Any
    }
}

impl Shape {
    /// Infers the shape of an existing value.
    pub fn of(value: &Value) -> Shape {
        match value {
            Value::Null => Shape::Any,
            Value::Bool(_) => Shape::Bool,
            Value::Int(_) => Shape::Integer,
            Value::BigInt(_) => Shape::BigInteger,
            Value::Decimal(_) => Shape::Decimal,
            Value::Text(_) => Shape::Text,
            Value::List(_) => Shape::List(Box::new(Shape::Any)),
            Value::Map(map) => Shape::Record {
                properties: map
                    .iter()
                    .map(|(k, v)| (k.clone(), Shape::of(v)))
                    .collect(),
                open: true,
            },
            Value::Ref(_) => Shape::Reference,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Shape::Any, _) => true,
            (_, Value::Null) => true,
            (Shape::Bool, Value::Bool(_)) => true,
            (Shape::Integer, Value::Int(_)) => true,
            (Shape::BigInteger, Value::BigInt(_) | Value::Int(_)) => true,
            (Shape::Decimal, Value::Decimal(_)) => true,
            (Shape::Text, Value::Text(_)) => true,
            (Shape::Reference, Value::Ref(_)) => true,
            (Shape::List(element), Value::List(items)) => {
                items.iter().all(|item| element.matches(item))
            }
            (Shape::Record { properties, open }, Value::Map(map)) => map.iter().all(|(k, v)| {
                match properties.get(k) {
                    Some(shape) => shape.matches(v),
                    None => *open,
                }
            }),
            _ => false,
        }
    }

    /// Validates a property write against this shape.
    ///
    /// Returns `Ok(Some(widened))` when the value is accepted but must be
    /// stored in a widened representation, `Ok(None)` when it is accepted
    /// as-is, and an [`PointerError::InvalidProperty`] otherwise.
    pub fn check_property(&self, key: &Key, value: &Value) -> Result<Option<Value>, PointerError> {
        let slot = match (self, key) {
            (Shape::Any, _) => return Ok(None),
            (Shape::Record { properties, open }, Key::Text(name)) => {
                match properties.get(name.as_str()) {
                    Some(shape) => shape,
                    None if *open => return Ok(None),
                    None => {
                        return Err(PointerError::InvalidProperty {
                            key: key.to_string(),
                            reason: "key is not part of the record".into(),
                        })
                    }
                }
            }
            (Shape::List(element), Key::Index(_)) => element.as_ref(),
            _ => {
                return Err(PointerError::InvalidProperty {
                    key: key.to_string(),
                    reason: format!("shape {self:?} has no such property"),
                })
            }
        };

        match (slot, value) {
            (Shape::BigInteger, Value::Int(v)) => Ok(Some(Value::BigInt(*v as i128))),
            _ if slot.matches(value) => Ok(None),
            _ => Err(PointerError::InvalidProperty {
                key: key.to_string(),
                reason: format!("value kind {:?} does not match {slot:?}", value.kind()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(open: bool) -> Shape {
        let mut properties = IndexMap::new();
        properties.insert("count".to_string(), Shape::BigInteger);
        properties.insert("name".to_string(), Shape::Text);
        Shape::Record { properties, open }
    }

    #[test]
    fn test_closed_record_rejects_unknown_key() {
        let shape = record(false);
        let err = shape
            .check_property(&Key::from("other"), &Value::Int(1))
            .unwrap_err();
        assert!(matches!(err, PointerError::InvalidProperty { .. }));
        assert!(record(true)
            .check_property(&Key::from("other"), &Value::Int(1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_int_widens_to_bigint() {
        let widened = record(false)
            .check_property(&Key::from("count"), &Value::Int(9))
            .unwrap();
        assert_eq!(widened, Some(Value::BigInt(9)));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let err = record(false)
            .check_property(&Key::from("name"), &Value::Int(1))
            .unwrap_err();
        assert!(matches!(err, PointerError::InvalidProperty { .. }));
    }

    #[test]
    fn test_list_element_shape() {
        let shape = Shape::List(Box::new(Shape::Integer));
        assert!(shape
            .check_property(&Key::from(0usize), &Value::Int(1))
            .is_ok());
        assert!(shape
            .check_property(&Key::from(0usize), &Value::Text("x".into()))
            .is_err());
    }

    #[test]
    fn test_inferred_shape_matches_value() {
        let value = Value::List(vec![Value::Int(1), Value::Text("a".into())]);
        assert!(Shape::of(&value).matches(&value));
    }
}
