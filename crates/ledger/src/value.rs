//! Typed column values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use ledgersync_core::SurrogateId;

use crate::amount::Amount;

/// A non-null column value after normalisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Free text, or a state after vocabulary validation.
    Text(String),
    Integer(i64),
    Amount(Amount),
    Timestamp(DateTime<Utc>),
    /// A resolved foreign key.
    Reference(SurrogateId),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_amount(&self) -> Option<Amount> {
        match self {
            FieldValue::Amount(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<SurrogateId> {
        match self {
            FieldValue::Reference(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<Amount> for FieldValue {
    fn from(value: Amount) -> Self {
        FieldValue::Amount(value)
    }
}

impl From<SurrogateId> for FieldValue {
    fn from(value: SurrogateId) -> Self {
        FieldValue::Reference(value)
    }
}

/// Column writes keyed by schema column name.
///
/// Keys are always `'static` schema names, never caller-supplied strings, so
/// storage backends may splice them into SQL.
pub type FieldChanges = BTreeMap<&'static str, FieldValue>;
