//! Collaborator ports used by the job handlers.
//!
//! The wire clients for the board, file store, accounting ledger and bank
//! live behind these traits; this crate ships a Postgres outbox / staging
//! implementation and in-memory fakes.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ledgersync_core::{AuditId, AuditTable, DomainError, EntityKind, SurrogateId};
use ledgersync_ledger::{EntityRow, Payload};

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("collaborator rejected the request: {0}")]
    Rejected(String),
}

/// Outbound side: tells external systems about ledger changes.
#[async_trait]
pub trait Propagator: Send + Sync {
    /// Push `row` out. A returned payload is written back through the
    /// reconciliation engine (e.g. an id the external system assigned).
    async fn propagate(
        &self,
        kind: EntityKind,
        row: &EntityRow,
        audit_id: AuditId,
    ) -> Result<Option<Payload>, CollaboratorError>;

    async fn retract(
        &self,
        kind: EntityKind,
        record_id: i64,
        audit_id: AuditId,
    ) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestAction {
    Upsert,
    Delete,
}

impl IngestAction {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestAction::Upsert => "upsert",
            IngestAction::Delete => "delete",
        }
    }
}

impl FromStr for IngestAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "upsert" => Ok(IngestAction::Upsert),
            "delete" => Ok(IngestAction::Delete),
            _ => Err(DomainError::unknown("ingest action", s)),
        }
    }
}

/// One staged payload awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundPayload {
    pub kind: EntityKind,
    pub action: IngestAction,
    pub payload: Payload,
}

impl InboundPayload {
    pub fn upsert(kind: EntityKind, payload: Payload) -> Self {
        Self {
            kind,
            action: IngestAction::Upsert,
            payload,
        }
    }

    pub fn delete(kind: EntityKind, payload: Payload) -> Self {
        Self {
            kind,
            action: IngestAction::Delete,
            payload,
        }
    }
}

/// A staged row that could not be turned into an [`InboundPayload`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("staged row {row_id} is undecodable: {reason}")]
pub struct UndecodablePayload {
    pub row_id: i64,
    pub reason: String,
}

/// One staged row as loaded. Rows decode independently, so a bad row never
/// hides the good ones staged with it.
pub type StagedPayload = Result<InboundPayload, UndecodablePayload>;

/// Inbound side: payloads staged by ingestion sources (parsed log files,
/// webhooks) keyed by the audit row that announced them.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn load(
        &self,
        table: AuditTable,
        record_id: i64,
    ) -> Result<Vec<StagedPayload>, CollaboratorError>;

    async fn mark_completed(&self, table: AuditTable, record_id: i64)
    -> Result<(), CollaboratorError>;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type WriteBack = Box<dyn Fn(EntityKind, &EntityRow) -> Option<Payload> + Send + Sync>;

/// Propagator fake that records every call.
#[derive(Default)]
pub struct RecordingPropagator {
    propagated: Mutex<Vec<(EntityKind, SurrogateId, AuditId)>>,
    retracted: Mutex<Vec<(EntityKind, i64, AuditId)>>,
    write_back: Option<WriteBack>,
}

impl RecordingPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_back(
        mut self,
        write_back: impl Fn(EntityKind, &EntityRow) -> Option<Payload> + Send + Sync + 'static,
    ) -> Self {
        self.write_back = Some(Box::new(write_back));
        self
    }

    pub fn propagated(&self) -> Vec<(EntityKind, SurrogateId, AuditId)> {
        lock(&self.propagated).clone()
    }

    pub fn retracted(&self) -> Vec<(EntityKind, i64, AuditId)> {
        lock(&self.retracted).clone()
    }
}

#[async_trait]
impl Propagator for RecordingPropagator {
    async fn propagate(
        &self,
        kind: EntityKind,
        row: &EntityRow,
        audit_id: AuditId,
    ) -> Result<Option<Payload>, CollaboratorError> {
        lock(&self.propagated).push((kind, row.id, audit_id));
        Ok(self.write_back.as_ref().and_then(|f| f(kind, row)))
    }

    async fn retract(
        &self,
        kind: EntityKind,
        record_id: i64,
        audit_id: AuditId,
    ) -> Result<(), CollaboratorError> {
        lock(&self.retracted).push((kind, record_id, audit_id));
        Ok(())
    }
}

/// Payload source fake backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryPayloadSource {
    staged: Mutex<HashMap<(AuditTable, i64), Vec<StagedPayload>>>,
    completed: Mutex<Vec<(AuditTable, i64)>>,
}

impl InMemoryPayloadSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, table: AuditTable, record_id: i64, payloads: Vec<InboundPayload>) {
        self.stage_rows(table, record_id, payloads.into_iter().map(Ok).collect());
    }

    /// Stage rows as loaded, undecodable ones included.
    pub fn stage_rows(&self, table: AuditTable, record_id: i64, rows: Vec<StagedPayload>) {
        lock(&self.staged).insert((table, record_id), rows);
    }

    pub fn is_completed(&self, table: AuditTable, record_id: i64) -> bool {
        lock(&self.completed).contains(&(table, record_id))
    }
}

#[async_trait]
impl PayloadSource for InMemoryPayloadSource {
    async fn load(
        &self,
        table: AuditTable,
        record_id: i64,
    ) -> Result<Vec<StagedPayload>, CollaboratorError> {
        Ok(lock(&self.staged)
            .get(&(table, record_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_completed(
        &self,
        table: AuditTable,
        record_id: i64,
    ) -> Result<(), CollaboratorError> {
        let mut completed = lock(&self.completed);
        if !completed.contains(&(table, record_id)) {
            completed.push((table, record_id));
        }
        Ok(())
    }
}
