//! "Already processed" markers keyed by `(handler, audit_id)`.
//!
//! A redelivered job carries the audit id of the change that produced it,
//! so a marker recorded after the first successful run turns every later
//! delivery of the same job into a no-op.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use ledgersync_core::AuditId;
use ledgersync_queue::HandlerName;

use crate::store::{StoreError, map_sqlx_error};

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn seen(&self, handler: &HandlerName, audit_id: AuditId) -> Result<bool, StoreError>;

    /// Record a marker; recording an existing marker is not an error.
    async fn record(&self, handler: &HandlerName, audit_id: AuditId) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    markers: Mutex<HashSet<(HandlerName, AuditId)>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn seen(&self, handler: &HandlerName, audit_id: AuditId) -> Result<bool, StoreError> {
        let markers = self
            .markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(markers.contains(&(handler.clone(), audit_id)))
    }

    async fn record(&self, handler: &HandlerName, audit_id: AuditId) -> Result<(), StoreError> {
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((handler.clone(), audit_id));
        Ok(())
    }
}

/// Postgres-backed markers in `processed_job`.
#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: Arc<PgPool>,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self), fields(handler = %handler, audit_id = audit_id.get()), err)]
    async fn seen(&self, handler: &HandlerName, audit_id: AuditId) -> Result<bool, StoreError> {
        let found: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM processed_job
            WHERE handler = $1 AND audit_id = $2
            "#,
        )
        .bind(handler.as_str())
        .bind(audit_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("seen", e))?;
        Ok(found.is_some())
    }

    #[instrument(skip(self), fields(handler = %handler, audit_id = audit_id.get()), err)]
    async fn record(&self, handler: &HandlerName, audit_id: AuditId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO processed_job (handler, audit_id)
            VALUES ($1, $2)
            ON CONFLICT (handler, audit_id) DO NOTHING
            "#,
        )
        .bind(handler.as_str())
        .bind(audit_id.get())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn markers_are_per_handler_and_audit_row() {
        let store = InMemoryIdempotencyStore::new();
        let propagate = HandlerName::from_static("ledger.propagate");
        let ingest = HandlerName::from_static("ledger.ingest");

        store.record(&propagate, AuditId::new(1)).await.unwrap();
        store.record(&propagate, AuditId::new(1)).await.unwrap();

        assert!(store.seen(&propagate, AuditId::new(1)).await.unwrap());
        assert!(!store.seen(&propagate, AuditId::new(2)).await.unwrap());
        assert!(!store.seen(&ingest, AuditId::new(1)).await.unwrap());
        assert_eq!(store.len(), 1);
    }
}
