//! Schema-agnostic record values.
//!
//! Table rows are opaque to the engine: a [`Record`] is an id plus a map of
//! named [`Value`]s. The set of shapes a value can take is closed and
//! documented on [`Value`]; snapshots copy values through [`Value::deep_copy`],
//! which refuses shapes that would not survive a round trip.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EngineError, ResultEngine};

/// A single field value.
///
/// Supported shapes:
/// - primitives: null, booleans, signed integers, finite floats, text
/// - date/time values (UTC)
/// - ordered sequences of values
/// - plain records (string-keyed maps of values)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(DateTime<Utc>),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Structural copy of the value.
    ///
    /// Fails with [`EngineError::UnsupportedValue`] on non-finite floats.
    pub fn deep_copy(&self) -> ResultEngine<Value> {
        Ok(match self {
            Self::Null => Self::Null,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::Float(f) => {
                if !f.is_finite() {
                    return Err(EngineError::UnsupportedValue(format!(
                        "non-finite float {f}"
                    )));
                }
                Self::Float(*f)
            }
            Self::Text(s) => Self::Text(s.clone()),
            Self::Date(d) => Self::Date(*d),
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(Value::deep_copy)
                    .collect::<ResultEngine<Vec<_>>>()?,
            ),
            Self::Record(fields) => Self::Record(copy_fields(fields)?),
        })
    }

    /// Checks the value without copying it; same rules as
    /// [`deep_copy`](Self::deep_copy).
    pub fn check_supported(&self) -> ResultEngine<()> {
        match self {
            Self::Float(f) if !f.is_finite() => Err(EngineError::UnsupportedValue(format!(
                "non-finite float {f}"
            ))),
            Self::List(items) => items.iter().try_for_each(Value::check_supported),
            Self::Record(fields) => fields.values().try_for_each(Value::check_supported),
            _ => Ok(()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

fn copy_fields(fields: &BTreeMap<String, Value>) -> ResultEngine<BTreeMap<String, Value>> {
    fields
        .iter()
        .map(|(name, value)| Ok((name.clone(), value.deep_copy()?)))
        .collect()
}

/// A table row: a unique id plus named fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn check_supported(&self) -> ResultEngine<()> {
        self.fields
            .values()
            .try_for_each(Value::check_supported)
            .map_err(|err| match err {
                EngineError::UnsupportedValue(reason) => {
                    EngineError::UnsupportedValue(format!("record {}: {reason}", self.id))
                }
                other => other,
            })
    }

    pub fn deep_copy(&self) -> ResultEngine<Record> {
        Ok(Record {
            id: self.id.clone(),
            fields: copy_fields(&self.fields)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_copy_keeps_nested_shapes() {
        let nested = Value::Record(BTreeMap::from([
            ("tags".to_string(), Value::List(vec!["a".into(), "b".into()])),
            ("at".to_string(), Value::Date(Utc::now())),
            ("ratio".to_string(), Value::Float(0.25)),
        ]));
        let record = Record::new("r1").with("meta", nested).with("n", 3_i64);

        assert_eq!(record.deep_copy().unwrap(), record);
    }

    #[test]
    fn deep_copy_rejects_non_finite_floats() {
        let record = Record::new("r1").with("meta", Value::List(vec![Value::Float(f64::NAN)]));

        assert!(matches!(
            record.deep_copy(),
            Err(EngineError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn optional_values_map_to_null() {
        let none: Option<&str> = None;
        assert!(Value::from(none).is_null());
        assert_eq!(Value::from(Some("x")), Value::Text("x".to_string()));
    }
}
