//! Per-entity idempotent upsert.
//!
//! One upsert runs in one short-lived transaction:
//!
//! 1. Normalize the payload against the entity schema.
//! 2. Look the row up by external id, locking it.
//! 3. Found: reject an older source version.
//!    Not found: check required fields and hard references.
//! 4. Resolve every reference present in the payload.
//! 5. Found: overwrite the present columns (absent means "no change").
//!    Not found: insert.
//! 6. Commit.
//!
//! Failures are isolated to the record: the transaction is rolled back and
//! the outcome carries `Fail`. Nothing here retries.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use ledgersync_core::{EntityKind, ExternalId, SurrogateId};
use ledgersync_ledger::{
    BankTransactionPayload, BillPayload, ContactPayload, DetailItemPayload, EntityPayload,
    EntitySchema, FieldValue, NormalizedPayload, Payload, PurchaseOrderPayload, schema,
};

use super::resolver::SurrogateKeyResolver;
use super::{ReconcileError, UpsertOutcome, UpsertStatus};
use crate::store::{LedgerStore, LedgerTx, RowLock};

pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    resolver: SurrogateKeyResolver,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn LedgerStore>, resolver: SurrogateKeyResolver) -> Self {
        Self { store, resolver }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Find-or-create the row for `payload.external_id` and merge its fields.
    #[instrument(
        skip(self, payload),
        fields(table = kind.table_name(), external_id = %payload.external_id)
    )]
    pub async fn upsert(&self, kind: EntityKind, payload: &Payload) -> UpsertOutcome {
        match self.try_upsert(kind, payload).await {
            Ok(outcome) => {
                match outcome.status {
                    UpsertStatus::Created | UpsertStatus::Updated => debug!(
                        status = ?outcome.status,
                        surrogate_id = ?outcome.surrogate_id,
                        "upsert applied"
                    ),
                    _ => info!(
                        status = ?outcome.status,
                        surrogate_id = ?outcome.surrogate_id,
                        "upsert skipped"
                    ),
                }
                outcome
            }
            Err(err) => {
                warn!(error = %err, "upsert failed");
                UpsertOutcome::fail(err)
            }
        }
    }

    pub async fn upsert_typed<P: EntityPayload>(&self, payload: P) -> UpsertOutcome {
        self.upsert(P::KIND, &payload.into_payload()).await
    }

    pub async fn upsert_purchase_order(&self, payload: PurchaseOrderPayload) -> UpsertOutcome {
        self.upsert_typed(payload).await
    }

    pub async fn upsert_detail_item(&self, payload: DetailItemPayload) -> UpsertOutcome {
        self.upsert_typed(payload).await
    }

    pub async fn upsert_contact(&self, payload: ContactPayload) -> UpsertOutcome {
        self.upsert_typed(payload).await
    }

    pub async fn upsert_bill(&self, payload: BillPayload) -> UpsertOutcome {
        self.upsert_typed(payload).await
    }

    pub async fn upsert_bank_transaction(&self, payload: BankTransactionPayload) -> UpsertOutcome {
        self.upsert_typed(payload).await
    }

    /// Delete the row keyed by `external_id`, if any.
    #[instrument(skip(self), fields(table = kind.table_name()), err)]
    pub async fn delete(
        &self,
        kind: EntityKind,
        external_id: &ExternalId,
    ) -> Result<Option<SurrogateId>, ReconcileError> {
        let mut tx = self.store.begin().await?;
        match tx.delete_by_external(kind, external_id).await {
            Ok(deleted) => {
                tx.commit().await?;
                Ok(deleted)
            }
            Err(err) => {
                rollback_quietly(tx.as_mut()).await;
                Err(err.into())
            }
        }
    }

    async fn try_upsert(
        &self,
        kind: EntityKind,
        payload: &Payload,
    ) -> Result<UpsertOutcome, ReconcileError> {
        let schema = schema(kind);
        let normalized = schema.normalize(payload)?;

        let mut tx = self.store.begin().await?;
        match self.apply(tx.as_mut(), schema, payload, normalized).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                rollback_quietly(tx.as_mut()).await;
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn LedgerTx,
        schema: &'static EntitySchema,
        payload: &Payload,
        normalized: NormalizedPayload,
    ) -> Result<UpsertOutcome, ReconcileError> {
        let kind = schema.kind;
        let existing = tx
            .find_by_external(kind, &payload.external_id, RowLock::Exclusive)
            .await?;

        match &existing {
            Some(row) if !row.accepts_version(payload.source_version) => {
                return Ok(UpsertOutcome::stale(row.id));
            }
            Some(_) => {}
            None => check_creatable(schema, &normalized)?,
        }

        let mut changes = normalized.changes.clone();
        for (dependency, external_id) in &normalized.references {
            let resolution = self.resolver.resolve(tx, *dependency, external_id).await?;
            if let Some(id) = resolution.surrogate_id() {
                changes.insert(dependency.column, FieldValue::Reference(id));
            }
        }

        match existing {
            Some(row) => {
                let version = row.next_version(payload.source_version);
                let mut merged = row.clone();
                if merged.apply(&changes) || version != row.source_version {
                    tx.update(kind, row.id, &changes, version).await?;
                }
                Ok(UpsertOutcome::updated(row.id))
            }
            None => {
                let id = tx
                    .insert(kind, &payload.external_id, &changes, payload.source_version)
                    .await?;
                Ok(UpsertOutcome::created(id))
            }
        }
    }
}

/// A new row needs its required fields and a reference for every hard
/// dependency.
fn check_creatable(
    schema: &'static EntitySchema,
    normalized: &NormalizedPayload,
) -> Result<(), ReconcileError> {
    let missing = normalized.missing_required(schema);
    if !missing.is_empty() {
        return Err(ReconcileError::Validation(format!(
            "{}: missing required field(s) {}",
            schema.table(),
            missing.join(", ")
        )));
    }
    if let Some(dependency) = normalized.missing_hard_dependencies(schema).first() {
        return Err(ReconcileError::MissingHardDependency {
            table: schema.table(),
            dependency: dependency.name,
            target: dependency.target,
        });
    }
    Ok(())
}

async fn rollback_quietly(tx: &mut dyn LedgerTx) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "rollback failed");
    }
}
