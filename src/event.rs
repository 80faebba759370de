//! Metric events flowing through the rule engine and the forwarder
//!
//! An event is a flat JSON object with three standard fields:
//!
//! - `metricValue` (required, finite number)
//! - `level` (optional integer)
//! - `timestamp` (optional epoch millis, filled with "now" when absent)
//!
//! Anything else is carried as-is. Event *properties* are a separate string
//! map that is copied onto the outgoing broker message, not into the body.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::ValidationError;

pub const METRIC_VALUE: &str = "metricValue";
pub const LEVEL: &str = "level";
pub const TIMESTAMP: &str = "timestamp";

/// A validated metric event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct EventMap {
    values: Map<String, Value>,
    properties: BTreeMap<String, String>,
}

impl EventMap {
    pub fn new(metric_value: f64) -> Self {
        let mut values = Map::new();
        values.insert(METRIC_VALUE.to_string(), number(metric_value));
        values.insert(TIMESTAMP.to_string(), Value::from(now_millis()));
        Self {
            values,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_level(mut self, level: i64) -> Self {
        self.values.insert(LEVEL.to_string(), Value::from(level));
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.values.insert(TIMESTAMP.to_string(), Value::from(timestamp));
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Build an event from an untyped map, coercing standard fields
    ///
    /// Quoted or stringly-typed standard fields (`"12.5"`) are parsed the
    /// same way agents send them.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, ValidationError> {
        let mut values = Map::with_capacity(map.len());
        for (key, value) in map {
            let key = strip_quotes(&key).to_string();
            match key.as_str() {
                METRIC_VALUE => {
                    let parsed = coerce_f64(&value)
                        .ok_or_else(|| ValidationError::NonNumericMetricValue(value.to_string()))?;
                    values.insert(key, number(parsed));
                }
                LEVEL | TIMESTAMP => {
                    if value.is_null() {
                        continue;
                    }
                    let parsed = coerce_f64(&value).ok_or_else(|| ValidationError::InvalidField {
                        field: key.clone(),
                        value: value.to_string(),
                    })?;
                    values.insert(key, Value::from(parsed as i64));
                }
                _ => {
                    values.insert(key, value);
                }
            }
        }
        values
            .entry(TIMESTAMP.to_string())
            .or_insert_with(|| Value::from(now_millis()));

        Self::check_event(&values)?;
        Ok(Self {
            values,
            properties: BTreeMap::new(),
        })
    }

    /// Parse an event from JSON text
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        match value {
            Value::Object(map) => Self::from_map(map),
            other => Err(ValidationError::Malformed(other.to_string())),
        }
    }

    /// Check the shape of an untyped event
    pub fn check_event(map: &Map<String, Value>) -> Result<(), ValidationError> {
        let value = map
            .get(METRIC_VALUE)
            .ok_or(ValidationError::MissingMetricValue)?;
        let metric = value
            .as_f64()
            .ok_or_else(|| ValidationError::NonNumericMetricValue(value.to_string()))?;
        if !metric.is_finite() {
            return Err(ValidationError::NonFiniteMetricValue(metric));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        Self::check_event(&self.values)
    }

    pub fn metric_value(&self) -> f64 {
        self.values
            .get(METRIC_VALUE)
            .and_then(Value::as_f64)
            .unwrap_or(f64::NAN)
    }

    pub fn level(&self) -> Option<i64> {
        self.values.get(LEVEL).and_then(Value::as_i64)
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.values.get(TIMESTAMP).and_then(Value::as_i64)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(name.into(), value.into());
    }
}

impl TryFrom<Map<String, Value>> for EventMap {
    type Error = ValidationError;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        Self::from_map(map)
    }
}

impl From<EventMap> for Map<String, Value> {
    fn from(event: EventMap) -> Self {
        event.values
    }
}

/// An event on its way into the local CEP engine or out to a broker
///
/// The variant decides which ingestion path the local engine uses.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// A typed event, properties included
    Raw(EventMap),

    /// A flattened key/value event
    Keyed(Map<String, Value>),

    /// Serialized JSON text
    Text(String),
}

impl EventPayload {
    /// Reject payloads that can never be delivered
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            EventPayload::Raw(event) => event.validate(),
            // Same coercion the engine applies on ingestion
            EventPayload::Keyed(map) => EventMap::from_map(map.clone()).map(|_| ()),
            EventPayload::Text(text) => EventMap::parse(text).map(|_| ()),
        }
    }

    /// Body of an outgoing broker message
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            EventPayload::Raw(event) => serde_json::to_string(event.values()),
            EventPayload::Keyed(map) => serde_json::to_string(map),
            EventPayload::Text(text) => Ok(text.clone()),
        }
    }

    /// Value stored in the event cache
    pub fn to_value(&self) -> Value {
        match self {
            EventPayload::Raw(event) => Value::Object(event.values().clone()),
            EventPayload::Keyed(map) => Value::Object(map.clone()),
            EventPayload::Text(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
        }
    }

    /// Properties copied onto the outgoing message envelope
    pub fn properties(&self) -> BTreeMap<String, String> {
        match self {
            EventPayload::Raw(event) => event.properties().clone(),
            EventPayload::Keyed(_) | EventPayload::Text(_) => BTreeMap::new(),
        }
    }
}

impl From<EventMap> for EventPayload {
    fn from(event: EventMap) -> Self {
        EventPayload::Raw(event)
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => strip_quotes(s.trim()).parse().ok(),
        _ => None,
    }
}

fn strip_quotes(s: &str) -> &str {
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted { &s[1..s.len() - 1] } else { s }
}

// NaN and infinities have no JSON representation and end up as null
fn number(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
