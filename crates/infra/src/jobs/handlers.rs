//! The three ledger job handlers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use ledgersync_core::{EntityKind, SurrogateId};
use ledgersync_ledger::dependency_depth;
use ledgersync_queue::JobEnvelope;

use super::ports::{IngestAction, PayloadSource, Propagator, StagedPayload};
use super::{HandlerError, JobHandler};
use crate::reconcile::{ReconcileError, ReconciliationEngine, UpsertStatus};
use crate::store::LedgerStore;

fn entity_kind(job: &JobEnvelope) -> Result<EntityKind, HandlerError> {
    job.route()
        .table
        .entity_kind()
        .ok_or(HandlerError::UnsupportedRoute(job.route()))
}

/// `ledger.propagate`: push a changed row to the external systems.
pub struct PropagateHandler {
    store: Arc<dyn LedgerStore>,
    engine: Arc<ReconciliationEngine>,
    propagator: Arc<dyn Propagator>,
}

impl PropagateHandler {
    pub fn new(engine: Arc<ReconciliationEngine>, propagator: Arc<dyn Propagator>) -> Self {
        Self {
            store: engine.store().clone(),
            engine,
            propagator,
        }
    }
}

#[async_trait]
impl JobHandler for PropagateHandler {
    async fn handle(&self, job: &JobEnvelope) -> Result<String, HandlerError> {
        let kind = entity_kind(job)?;
        let record_id = job.record_id();

        let Some(row) = self.store.get(kind, SurrogateId::new(record_id)).await? else {
            return Ok(format!("{kind} {record_id} no longer exists; skipped"));
        };

        let Some(write_back) = self.propagator.propagate(kind, &row, job.audit_id()).await? else {
            return Ok(format!("{kind} {record_id} propagated"));
        };

        let outcome = self.engine.upsert(kind, &write_back).await;
        match outcome.error {
            Some(err) if err.is_transient() => Err(err.into()),
            _ => Ok(format!(
                "{kind} {record_id} propagated; write-back {:?}",
                outcome.status
            )),
        }
    }
}

/// `ledger.retract`: tell the external systems a row was deleted.
pub struct RetractHandler {
    propagator: Arc<dyn Propagator>,
}

impl RetractHandler {
    pub fn new(propagator: Arc<dyn Propagator>) -> Self {
        Self { propagator }
    }
}

#[async_trait]
impl JobHandler for RetractHandler {
    async fn handle(&self, job: &JobEnvelope) -> Result<String, HandlerError> {
        let kind = entity_kind(job)?;
        self.propagator
            .retract(kind, job.record_id(), job.audit_id())
            .await?;
        Ok(format!("{kind} {} retracted", job.record_id()))
    }
}

/// Counts reported by one ingest run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub created: usize,
    pub updated: usize,
    pub stale: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} stale={} deleted={} failed={}",
            self.created, self.updated, self.stale, self.deleted, self.failed
        )
    }
}

/// `ledger.ingest`: apply staged payloads, dependencies first.
///
/// Each payload is its own upsert. A failed record is logged and counted and
/// never blocks its siblings; only a storage failure aborts the run (so the
/// job is redelivered and the already-applied siblings re-apply as no-ops).
pub struct IngestHandler {
    engine: Arc<ReconciliationEngine>,
    source: Arc<dyn PayloadSource>,
}

impl IngestHandler {
    pub fn new(engine: Arc<ReconciliationEngine>, source: Arc<dyn PayloadSource>) -> Self {
        Self { engine, source }
    }

    pub async fn ingest(
        &self,
        staged: Vec<StagedPayload>,
    ) -> Result<IngestSummary, ReconcileError> {
        let mut summary = IngestSummary::default();
        let mut staged: Vec<_> = staged
            .into_iter()
            .filter_map(|item| match item {
                Ok(item) => Some(item),
                Err(bad) => {
                    warn!(row_id = bad.row_id, reason = %bad.reason, "staged payload undecodable");
                    summary.failed += 1;
                    None
                }
            })
            .collect();

        // Upserts land targets before dependents; deletes go the other way.
        staged.sort_by_key(|item| {
            let depth = dependency_depth(item.kind) as isize;
            match item.action {
                IngestAction::Upsert => (0, depth),
                IngestAction::Delete => (1, -depth),
            }
        });

        for item in &staged {
            match item.action {
                IngestAction::Upsert => {
                    let outcome = self.engine.upsert(item.kind, &item.payload).await;
                    match outcome.status {
                        UpsertStatus::Created => summary.created += 1,
                        UpsertStatus::Updated => summary.updated += 1,
                        UpsertStatus::Stale => summary.stale += 1,
                        UpsertStatus::Fail => match outcome.error {
                            Some(err) if err.is_transient() => return Err(err),
                            err => {
                                warn!(
                                    kind = %item.kind,
                                    external_id = %item.payload.external_id,
                                    error = ?err.map(|e| e.to_string()),
                                    "staged payload rejected"
                                );
                                summary.failed += 1;
                            }
                        },
                    }
                }
                IngestAction::Delete => {
                    match self.engine.delete(item.kind, &item.payload.external_id).await {
                        Ok(Some(_)) => summary.deleted += 1,
                        Ok(None) => {}
                        Err(err) if err.is_transient() => return Err(err),
                        Err(err) => {
                            warn!(
                                kind = %item.kind,
                                external_id = %item.payload.external_id,
                                error = %err,
                                "staged deletion rejected"
                            );
                            summary.failed += 1;
                        }
                    }
                }
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl JobHandler for IngestHandler {
    async fn handle(&self, job: &JobEnvelope) -> Result<String, HandlerError> {
        let table = job.route().table;
        let record_id = job.record_id();

        let staged = self.source.load(table, record_id).await?;
        let total = staged.len();
        let summary = self.ingest(staged).await?;
        self.source.mark_completed(table, record_id).await?;

        info!(table = %table, record_id, total, summary = %summary, "ingest finished");
        Ok(format!("{table} {record_id}: {total} payload(s); {summary}"))
    }
}
