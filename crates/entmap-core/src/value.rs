//! Dynamic column values and entity identities.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A scalar as stored in a column.
///
/// Rows read from a row source and the scalar fields of objects both hold
/// `Value`s. `Int` and `BigInt` are distinct variants but compare alike
/// under [`Value::matches`], which is the comparison identities use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Column type name, for error messages.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
        }
    }

    /// Integer content, widening `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(i64::from(v)),
            Value::BigInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Equality as a store sees it: integer widths are ignored.
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_) | Value::BigInt(_), Value::Int(_) | Value::BigInt(_)) => {
                self.as_i64() == other.as_i64()
            }
            _ => self == other,
        }
    }

    /// Total order for sorting loaded collections.
    ///
    /// `Null` sorts first; integers of either width and doubles compare
    /// numerically. Values of unrelated types order by type.
    #[allow(clippy::cast_precision_loss)]
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::BigInt(_) | Value::Double(_) => 2,
                Value::Text(_) => 3,
                Value::Bytes(_) => 4,
            }
        }
        fn numeric(v: &Value) -> f64 {
            match v {
                Value::Double(d) => *d,
                _ => v.as_i64().map_or(0.0, |i| i as f64),
            }
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ if rank(self) == 2 && rank(other) == 2 => match (self.as_i64(), other.as_i64()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => numeric(self).total_cmp(&numeric(other)),
            },
            _ => rank(self).cmp(&rank(other)),
        }
    }

    /// The value following this one in a version sequence.
    ///
    /// Integer variants keep their width; `Null` starts a fresh sequence at
    /// `initial`. Returns `None` for non-integer values and on overflow.
    pub fn next_version(&self, initial: i64) -> Option<Value> {
        match self {
            Value::Null => Some(Value::BigInt(initial)),
            Value::Int(v) => v.checked_add(1).map(Value::Int),
            Value::BigInt(v) => v.checked_add(1).map(Value::BigInt),
            _ => None,
        }
    }
}

fn hash_value(v: &Value, hasher: &mut impl Hasher) {
    // one tag for both integer widths, so ids equal under `matches` collide
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => (1u8, b).hash(hasher),
        Value::Int(_) | Value::BigInt(_) => (2u8, v.as_i64()).hash(hasher),
        Value::Double(f) => (3u8, f.to_bits()).hash(hasher),
        Value::Text(s) => (4u8, s).hash(hasher),
        Value::Bytes(b) => (5u8, b).hash(hasher),
    }
}

/// Identifier values of one entity instance, in identifier-column order.
///
/// Usable as a hash key: integer widths are normalised and floating point
/// identifiers compare by bit pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityId(Vec<Value>);

impl EntityId {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Single-column identity.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// An identity is complete once no component is NULL.
    pub fn is_complete(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|v| !v.is_null())
    }
}

impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.matches(b))
    }
}

impl Eq for EntityId {}

impl Hash for EntityId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in &self.0 {
            hash_value(v, state);
        }
    }
}

impl From<Value> for EntityId {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self::single(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::single(value)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn entity_id_matches_across_integer_widths() {
        let mut map = HashMap::new();
        map.insert(EntityId::single(Value::Int(42)), "row");
        assert_eq!(map.get(&EntityId::single(Value::BigInt(42))), Some(&"row"));
        assert!(!map.contains_key(&EntityId::single(Value::Text("42".into()))));
    }

    #[test]
    fn entity_id_completeness() {
        assert!(EntityId::from(1i64).is_complete());
        assert!(!EntityId::new(vec![Value::BigInt(1), Value::Null]).is_complete());
        assert!(!EntityId::new(Vec::new()).is_complete());
    }

    #[test]
    fn next_version_keeps_width() {
        assert_eq!(Value::Null.next_version(1), Some(Value::BigInt(1)));
        assert_eq!(Value::Int(4).next_version(1), Some(Value::Int(5)));
        assert_eq!(Value::BigInt(9).next_version(1), Some(Value::BigInt(10)));
        assert_eq!(Value::Text("v1".into()).next_version(1), None);
        assert_eq!(Value::Int(i32::MAX).next_version(1), None);
    }

    #[test]
    fn sort_order() {
        let mut values = vec![
            Value::Text("b".into()),
            Value::BigInt(7),
            Value::Null,
            Value::Double(2.5),
            Value::Int(3),
            Value::Text("a".into()),
        ];
        values.sort_by(Value::sort_cmp);
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Double(2.5),
                Value::Int(3),
                Value::BigInt(7),
                Value::Text("a".into()),
                Value::Text("b".into()),
            ]
        );
        assert_eq!(Value::Int(3).sort_cmp(&Value::BigInt(3)), Ordering::Equal);
    }
}
