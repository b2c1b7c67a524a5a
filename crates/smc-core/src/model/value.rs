use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Static type of a function's return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Real,
    Integer,
    Boolean,
    /// A user-declared type whose values are named objects.
    Symbol(Arc<str>),
}

impl ValueType {
    pub fn symbol(name: &str) -> Self {
        ValueType::Symbol(Arc::from(name))
    }

    pub const fn is_real(&self) -> bool {
        matches!(self, ValueType::Real)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Real => f.write_str("Real"),
            ValueType::Integer => f.write_str("Integer"),
            ValueType::Boolean => f.write_str("Boolean"),
            ValueType::Symbol(name) => f.write_str(name),
        }
    }
}

/// A value assigned to a random variable.
///
/// Reals compare and hash by their total order so values can key histograms
/// and ordered maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Symbol(Arc<str>),
}

impl Value {
    pub fn symbol(name: &str) -> Self {
        Value::Symbol(Arc::from(name))
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(value) => Some(*value),
            Value::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Value::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// Returns true if this value inhabits `ty`. Symbol membership in the
    /// declared object set is checked by the model, not here.
    pub fn conforms_to(&self, ty: &ValueType) -> bool {
        matches!(
            (self, ty),
            (Value::Boolean(_), ValueType::Boolean)
                | (Value::Integer(_), ValueType::Integer)
                | (Value::Real(_), ValueType::Real)
                | (Value::Symbol(_), ValueType::Symbol(_))
        )
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Boolean(_) => 0,
            Value::Integer(_) => 1,
            Value::Real(_) => 2,
            Value::Symbol(_) => 3,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Symbol(a), Value::Symbol(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Boolean(value) => value.hash(state),
            Value::Integer(value) => value.hash(state),
            Value::Real(value) => value.to_bits().hash(state),
            Value::Symbol(name) => name.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(value) => write!(f, "{value}"),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Real(value) => write!(f, "{value}"),
            Value::Symbol(name) => f.write_str(name),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn reals_order_totally() {
        let mut set = BTreeSet::new();
        set.insert(Value::Real(2.0));
        set.insert(Value::Real(-1.0));
        set.insert(Value::Real(2.0));
        assert_eq!(set.len(), 2);
        assert_eq!(set.first(), Some(&Value::Real(-1.0)));
    }

    #[test]
    fn conformance_ignores_symbol_type_name() {
        assert!(Value::symbol("Rainy").conforms_to(&ValueType::symbol("Weather")));
        assert!(!Value::Real(1.0).conforms_to(&ValueType::Integer));
    }
}
