//! Typed values flowing between the variable store, conditions and actions.
//!
//! `Value` is the tagged union shared by every rule-engine surface. The
//! comparison rules are deliberately forgiving: numeric and boolean
//! operands widen to `f64` so a rule can compare an integer sensor
//! reading against a float threshold, and equality carries a small
//! tolerance so float round-trips through JSON do not flip conditions.

use schemars::JsonSchema;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Maximum length of a stored string value, in bytes.
pub const MAX_STRING_LEN: usize = 256;

/// Tolerance applied to numeric equality comparisons.
pub const EQ_TOLERANCE: f64 = 1e-4;

/// Discriminator for [`Value`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Str,
}

/// A typed variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(String),
}

impl Value {
    /// The variant discriminator.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Str(_) => ValueType::Str,
        }
    }

    /// Widen a numeric or boolean value to `f64`. Strings do not widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(f64::from(*i)),
            Value::Float(f) => Some(*f),
            Value::Str(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Equality with numeric widening and [`EQ_TOLERANCE`].
    ///
    /// Strings only ever equal strings; a string never equals a number.
    pub fn loosely_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Str(_), _) | (_, Value::Str(_)) => false,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() <= EQ_TOLERANCE,
                _ => false,
            },
        }
    }

    /// Ordering comparison. Strings compare lexicographically against
    /// strings; numeric/boolean operands widen to float. Mixed
    /// string/number operands are incomparable.
    pub fn partial_cmp_loose(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Str(_), _) | (_, Value::Str(_)) => None,
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Substring test: true iff both operands are strings and `self`
    /// contains `needle`.
    pub fn contains(&self, needle: &Value) -> bool {
        match (self, needle) {
            (Value::Str(haystack), Value::Str(needle)) => haystack.contains(needle.as_str()),
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Bool(false)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
        }
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

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

// Persisted form is the bare JSON scalar; the numeric classification rule
// (integer iff exactly representable in i32) keeps round-trips stable.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i32(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
        }
    }
}

struct ValueVisitor;

fn classify_f64(v: f64) -> Value {
    if v.fract() == 0.0 && v >= f64::from(i32::MIN) && v <= f64::from(i32::MAX) {
        Value::Int(v as i32)
    } else {
        Value::Float(v)
    }
}

impl Visitor<'_> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a boolean, number or string")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(match i32::try_from(v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(v as f64),
        })
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        Ok(match i32::try_from(v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(v as f64),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(classify_f64(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::Str(v))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

impl JsonSchema for Value {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "Value".into()
    }

    fn json_schema(_generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        schemars::json_schema!({
            "type": ["boolean", "number", "string"]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_widening_covers_bool_and_int() {
        assert!(Value::Bool(true).loosely_eq(&Value::Int(1)));
        assert!(Value::Int(80).loosely_eq(&Value::Float(80.00001)));
        assert!(!Value::Int(80).loosely_eq(&Value::Float(80.2)));
    }

    #[test]
    fn strings_never_equal_numbers() {
        assert!(!Value::Str("80".to_string()).loosely_eq(&Value::Int(80)));
        assert!(Value::Str("a".to_string()).loosely_eq(&Value::Str("a".to_string())));
    }

    #[test]
    fn ordering_is_lexicographic_for_strings() {
        use std::cmp::Ordering;
        assert_eq!(
            Value::Str("abc".to_string()).partial_cmp_loose(&Value::Str("abd".to_string())),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Str("a".to_string()).partial_cmp_loose(&Value::Int(1)),
            None
        );
    }

    #[test]
    fn contains_requires_both_strings() {
        let hay = Value::Str("temperature high".to_string());
        assert!(hay.contains(&Value::Str("high".to_string())));
        assert!(!hay.contains(&Value::Int(1)));
        assert!(!Value::Int(1).contains(&Value::Str("1".to_string())));
    }

    #[test]
    fn json_numbers_classify_to_int_when_exact() {
        let v: Value = serde_json::from_str("80").expect("decode");
        assert_eq!(v, Value::Int(80));
        let v: Value = serde_json::from_str("80.0").expect("decode");
        assert_eq!(v, Value::Int(80));
        let v: Value = serde_json::from_str("80.5").expect("decode");
        assert_eq!(v, Value::Float(80.5));
        let v: Value = serde_json::from_str("4294967296").expect("decode");
        assert_eq!(v, Value::Float(4294967296.0));
    }

    #[test]
    fn json_round_trip_preserves_type_and_content() {
        for v in [
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(3.25),
            Value::Str("hosts.agx.ip".to_string()),
        ] {
            let json = serde_json::to_string(&v).expect("encode");
            let back: Value = serde_json::from_str(&json).expect("decode");
            assert_eq!(back, v);
        }
    }
}
