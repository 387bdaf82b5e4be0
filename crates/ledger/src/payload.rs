//! Normalized reconciliation payloads.
//!
//! A [`Payload`] is what an external system said about one entity, keyed by
//! that system's identifier. Absent keys and JSON `null` both mean "no change";
//! there is no way to clear a column through a payload.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use ledgersync_core::{DomainError, DomainResult, ExternalId};

use crate::amount::Amount;
use crate::schema::{DependencyPolicy, DependencySpec, EntitySchema, FieldType};
use crate::state::canonical_state;
use crate::value::{FieldChanges, FieldValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub external_id: ExternalId,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
    /// Dependency name -> external id of the related entity.
    #[serde(default)]
    pub references: BTreeMap<String, Option<ExternalId>>,
    /// Monotonic version assigned by the source system, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version: Option<i64>,
}

impl Payload {
    pub fn new(external_id: ExternalId) -> Self {
        Self {
            external_id,
            fields: BTreeMap::new(),
            references: BTreeMap::new(),
            source_version: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set `name` only when `value` is present.
    pub fn field_opt<V: Into<JsonValue>>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.field(name, v),
            None => self,
        }
    }

    pub fn reference(mut self, name: impl Into<String>, external_id: ExternalId) -> Self {
        self.references.insert(name.into(), Some(external_id));
        self
    }

    pub fn reference_opt(self, name: impl Into<String>, external_id: Option<ExternalId>) -> Self {
        match external_id {
            Some(id) => self.reference(name, id),
            None => self,
        }
    }

    pub fn with_source_version(mut self, version: i64) -> Self {
        self.source_version = Some(version);
        self
    }
}

/// A payload checked against its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPayload {
    pub changes: FieldChanges,
    /// Present references, in schema declaration order.
    pub references: Vec<(&'static DependencySpec, ExternalId)>,
}

impl NormalizedPayload {
    /// Required fields absent from this payload (relevant on create only).
    pub fn missing_required(&self, schema: &'static EntitySchema) -> Vec<&'static str> {
        schema
            .required_fields()
            .filter(|name| !self.changes.contains_key(name))
            .collect()
    }

    /// Hard dependencies this payload carries no reference for. A new row
    /// cannot exist without them.
    pub fn missing_hard_dependencies(
        &self,
        schema: &'static EntitySchema,
    ) -> Vec<&'static DependencySpec> {
        schema
            .dependencies
            .iter()
            .filter(|d| d.policy == DependencyPolicy::Hard)
            .filter(|d| !self.references.iter().any(|(spec, _)| spec.name == d.name))
            .collect()
    }
}

impl EntitySchema {
    /// Validate and type every present field and reference of `payload`.
    pub fn normalize(&'static self, payload: &Payload) -> DomainResult<NormalizedPayload> {
        let mut changes = FieldChanges::new();
        for (name, raw) in &payload.fields {
            if name == self.external_column {
                // The identity travels in `external_id`; a copy in fields is ignored.
                continue;
            }
            let spec = self.field(name).ok_or_else(|| {
                DomainError::validation(format!("{}: unknown field {name:?}", self.table()))
            })?;
            if raw.is_null() {
                continue;
            }
            let value = coerce(spec.ty, raw).map_err(|e| {
                DomainError::validation(format!("{}.{}: {e}", self.table(), spec.name))
            })?;
            changes.insert(spec.name, value);
        }

        let mut references = Vec::new();
        for (name, external) in &payload.references {
            let spec = self.dependency(name).ok_or_else(|| {
                DomainError::validation(format!("{}: unknown reference {name:?}", self.table()))
            })?;
            if let Some(external) = external {
                references.push((spec, external.clone()));
            }
        }
        references.sort_by_key(|(spec, _)| {
            self.dependencies
                .iter()
                .position(|d| d.name == spec.name)
                .unwrap_or(usize::MAX)
        });

        Ok(NormalizedPayload {
            changes,
            references,
        })
    }
}

fn coerce(ty: FieldType, raw: &JsonValue) -> DomainResult<FieldValue> {
    match ty {
        FieldType::Text => match raw {
            JsonValue::String(s) => Ok(FieldValue::Text(s.clone())),
            JsonValue::Number(n) => Ok(FieldValue::Text(n.to_string())),
            JsonValue::Bool(b) => Ok(FieldValue::Text(b.to_string())),
            other => Err(DomainError::validation(format!("expected text, got {other}"))),
        },
        FieldType::Integer => match raw {
            JsonValue::Number(n) => n
                .as_i64()
                .map(FieldValue::Integer)
                .ok_or_else(|| DomainError::validation(format!("expected an integer, got {n}"))),
            JsonValue::String(s) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| DomainError::validation(format!("expected an integer, got {s:?}"))),
            other => Err(DomainError::validation(format!(
                "expected an integer, got {other}"
            ))),
        },
        FieldType::Amount => Amount::from_json(raw).map(FieldValue::Amount),
        FieldType::Timestamp => match raw {
            JsonValue::String(s) => parse_timestamp(s).map(FieldValue::Timestamp),
            other => Err(DomainError::validation(format!(
                "expected a timestamp, got {other}"
            ))),
        },
        FieldType::State(names) => match raw {
            JsonValue::String(s) => canonical_state(names, s)
                .map(|canonical| FieldValue::Text(canonical.to_string()))
                .ok_or_else(|| {
                    DomainError::validation(format!("{s:?} is not one of {names:?}"))
                }),
            other => Err(DomainError::validation(format!("expected a state, got {other}"))),
        },
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date (midnight UTC).
fn parse_timestamp(s: &str) -> DomainResult<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(DomainError::validation(format!("unrecognised timestamp {s:?}")))
}
