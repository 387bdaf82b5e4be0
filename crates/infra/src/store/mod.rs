//! Ledger storage abstraction.
//!
//! Every reconciled entity lives in its own table with a unique index on its
//! external-id column. Writes happen inside a [`LedgerTx`]: one short-lived
//! transaction per upsert, never spanning several records.
//!
//! ## Error Mapping
//!
//! Backends map their native failures onto [`StoreError`]:
//!
//! | Condition | StoreError |
//! |-----------|------------|
//! | Unique violation on the external-id index | `Conflict` |
//! | Foreign key / check / not-null violation | `Invalid` |
//! | Row expected but gone | `NotFound` |
//! | Anything else (pool closed, IO, decode) | `Backend` |

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use ledgersync_core::{EntityKind, ExternalId, SurrogateId};
use ledgersync_ledger::{EntityRow, FieldChanges};

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A concurrent writer already holds this external id.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The database rejected the row (referential or check constraint).
    #[error("invalid row: {0}")]
    Invalid(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Row lock taken by a lookup inside a [`LedgerTx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowLock {
    /// The row being upserted; concurrent upserts of one key serialize.
    Exclusive,
    /// A dependency target. Keeps it from being deleted without blocking
    /// other dependents or updates of the target itself.
    KeyShare,
}

/// Read access plus the ability to open a write transaction.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    /// Load a row by surrogate id, outside any transaction.
    async fn get(&self, kind: EntityKind, id: SurrogateId) -> Result<Option<EntityRow>, StoreError>;

    /// Load a row by external id, outside any transaction.
    async fn find(
        &self,
        kind: EntityKind,
        external_id: &ExternalId,
    ) -> Result<Option<EntityRow>, StoreError>;
}

/// One open write transaction.
///
/// Dropping a transaction without calling [`LedgerTx::commit`] discards its
/// writes.
#[async_trait]
pub trait LedgerTx: Send {
    async fn find_by_external(
        &mut self,
        kind: EntityKind,
        external_id: &ExternalId,
        lock: RowLock,
    ) -> Result<Option<EntityRow>, StoreError>;

    async fn insert(
        &mut self,
        kind: EntityKind,
        external_id: &ExternalId,
        changes: &FieldChanges,
        source_version: Option<i64>,
    ) -> Result<SurrogateId, StoreError>;

    /// Overwrite the named columns of an existing row.
    async fn update(
        &mut self,
        kind: EntityKind,
        id: SurrogateId,
        changes: &FieldChanges,
        source_version: Option<i64>,
    ) -> Result<(), StoreError>;

    async fn delete_by_external(
        &mut self,
        kind: EntityKind,
        external_id: &ExternalId,
    ) -> Result<Option<SurrogateId>, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        (**self).begin().await
    }

    async fn get(&self, kind: EntityKind, id: SurrogateId) -> Result<Option<EntityRow>, StoreError> {
        (**self).get(kind, id).await
    }

    async fn find(
        &self,
        kind: EntityKind,
        external_id: &ExternalId,
    ) -> Result<Option<EntityRow>, StoreError> {
        (**self).find(kind, external_id).await
    }
}

/// Map sqlx errors to StoreError by SQLSTATE.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") | Some("23514") | Some("23502") => StoreError::Invalid(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
