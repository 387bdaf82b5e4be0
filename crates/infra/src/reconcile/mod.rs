//! Idempotent reconciliation of external payloads into the ledger.

pub mod engine;
pub mod resolver;

use serde::{Serialize, Serializer};

use ledgersync_core::{DomainError, EntityKind, ExternalId, SurrogateId};

use crate::store::StoreError;

pub use engine::ReconciliationEngine;
pub use resolver::{Resolution, ResolverError, SurrogateKeyResolver};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unresolved hard dependency {dependency}: no {target} with external id {external_id}")]
    UnresolvedHardDependency {
        dependency: &'static str,
        target: EntityKind,
        external_id: ExternalId,
    },

    #[error("{table}: hard dependency {dependency} ({target}) is required on create")]
    MissingHardDependency {
        table: &'static str,
        dependency: &'static str,
        target: EntityKind,
    },

    #[error("no default configured for soft dependency {dependency} ({target})")]
    MissingDefault {
        dependency: &'static str,
        target: EntityKind,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(StoreError),
}

impl ReconcileError {
    /// Whether retrying the same payload later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Storage(_))
    }
}

impl From<DomainError> for ReconcileError {
    fn from(err: DomainError) -> Self {
        ReconcileError::Validation(err.to_string())
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ReconcileError::Conflict(msg),
            StoreError::Invalid(msg) => ReconcileError::Validation(msg),
            other => ReconcileError::Storage(other),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum UpsertStatus {
    Created,
    Updated,
    /// The payload's source version is older than the stored row's.
    Stale,
    Fail,
}

/// Result of one upsert: `{status, surrogate_id?, error?}`.
#[derive(Debug, Serialize)]
pub struct UpsertOutcome {
    pub status: UpsertStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surrogate_id: Option<SurrogateId>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_error"
    )]
    pub error: Option<ReconcileError>,
}

impl UpsertOutcome {
    pub fn created(id: SurrogateId) -> Self {
        Self::ok(UpsertStatus::Created, id)
    }

    pub fn updated(id: SurrogateId) -> Self {
        Self::ok(UpsertStatus::Updated, id)
    }

    pub fn stale(id: SurrogateId) -> Self {
        Self::ok(UpsertStatus::Stale, id)
    }

    pub fn fail(error: ReconcileError) -> Self {
        Self {
            status: UpsertStatus::Fail,
            surrogate_id: None,
            error: Some(error),
        }
    }

    fn ok(status: UpsertStatus, id: SurrogateId) -> Self {
        Self {
            status,
            surrogate_id: Some(id),
            error: None,
        }
    }

    pub fn is_fail(&self) -> bool {
        self.status == UpsertStatus::Fail
    }

    /// A failure that a later redelivery might not hit.
    pub fn is_transient_failure(&self) -> bool {
        self.error.as_ref().is_some_and(ReconcileError::is_transient)
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<ReconcileError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_str(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_without_absent_parts() {
        let json = serde_json::to_value(UpsertOutcome::created(SurrogateId::new(9))).unwrap();
        assert_eq!(json, serde_json::json!({"status": "Created", "surrogate_id": 9}));

        let json = serde_json::to_value(UpsertOutcome::fail(ReconcileError::Conflict(
            "duplicate".into(),
        )))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "Fail", "error": "conflict: duplicate"})
        );
    }

    #[test]
    fn only_storage_failures_are_transient() {
        assert!(ReconcileError::from(StoreError::Backend("down".into())).is_transient());
        assert!(!ReconcileError::from(StoreError::Conflict("dup".into())).is_transient());
        assert!(matches!(
            ReconcileError::from(StoreError::Invalid("fk".into())),
            ReconcileError::Validation(_)
        ));
    }
}
