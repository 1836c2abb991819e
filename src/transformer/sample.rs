//! Sample - the unit that flows through the transform pipeline

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute map of a sample
pub type Attributes = BTreeMap<String, Value>;

/// A transient attribute map tagged with an event type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Event type this sample is emitted as
    pub event_type: String,
    /// Attribute name -> value
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl Sample {
    /// Create an empty sample
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Create a sample from an existing attribute map
    pub fn with_attributes(event_type: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            event_type: event_type.into(),
            attributes,
        }
    }

    /// Set an attribute
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Numeric view of an attribute; numeric strings are parsed
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(value_as_f64)
    }

    /// String view of a scalar attribute
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.attributes.get(key).and_then(value_as_string)
    }
}

/// Numeric view of a JSON value
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// String view of a scalar JSON value
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Convert a raw token into the most specific JSON scalar
///
/// Integers and floats become numbers, everything else stays a string.
pub fn infer_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::String(trimmed.to_string())
}

/// JSON number from an f64, preferring an integer representation
pub fn number_value(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < (1u64 << 53) as f64 {
        Value::from(v as i64)
    } else {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
