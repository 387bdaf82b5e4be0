//! Read side of the audit log.
//!
//! Rows are appended by triggers outside this process; this side only reads
//! them, strictly ordered by id.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use ledgersync_core::{AuditEvent, AuditId};

#[derive(Debug, thiserror::Error)]
pub enum AuditLogError {
    #[error("audit log unavailable: {0}")]
    Unavailable(String),

    #[error("malformed audit row: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Highest id present, `None` when the log is empty.
    async fn max_id(&self) -> Result<Option<AuditId>, AuditLogError>;

    /// Rows with `id > after`, ascending, at most `limit` when given.
    async fn read_after(
        &self,
        after: AuditId,
        limit: Option<u32>,
    ) -> Result<Vec<AuditEvent>, AuditLogError>;
}

#[async_trait]
impl<L> AuditLog for Arc<L>
where
    L: AuditLog + ?Sized,
{
    async fn max_id(&self) -> Result<Option<AuditId>, AuditLogError> {
        (**self).max_id().await
    }

    async fn read_after(
        &self,
        after: AuditId,
        limit: Option<u32>,
    ) -> Result<Vec<AuditEvent>, AuditLogError> {
        (**self).read_after(after, limit).await
    }
}

#[derive(Debug, Default)]
struct LogState {
    rows: Vec<AuditEvent>,
    fail_next_read: bool,
}

/// In-memory audit log; `append` plays the part of the triggers.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    state: Mutex<LogState>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a row with the next id and return that id.
    pub fn append(&self, table: &str, operation: &str, record_id: i64) -> AuditId {
        let mut state = self.lock();
        let next = state.rows.last().map_or(1, |row| row.id.get() + 1);
        state
            .rows
            .push(AuditEvent::new(next, table, operation, record_id));
        AuditId::new(next)
    }

    /// Append a row with an explicit id (ids may have gaps).
    pub fn append_with_id(&self, id: i64, table: &str, operation: &str, record_id: i64) {
        let mut state = self.lock();
        state.rows.push(AuditEvent::new(id, table, operation, record_id));
        state.rows.sort_by_key(|row| row.id);
    }

    /// Fail the next `read_after` once.
    pub fn fail_next_read(&self) {
        self.lock().fail_next_read = true;
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn max_id(&self) -> Result<Option<AuditId>, AuditLogError> {
        Ok(self.lock().rows.last().map(|row| row.id))
    }

    async fn read_after(
        &self,
        after: AuditId,
        limit: Option<u32>,
    ) -> Result<Vec<AuditEvent>, AuditLogError> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_read) {
            return Err(AuditLogError::Unavailable("injected read failure".into()));
        }
        let rows = state.rows.iter().filter(|row| row.id > after).cloned();
        Ok(match limit {
            Some(limit) => rows.take(limit as usize).collect(),
            None => rows.collect(),
        })
    }
}

/// Audit log in Postgres: `audit_log` rows joined to `audit_table` for the
/// table name.
#[derive(Debug, Clone)]
pub struct PostgresAuditLog {
    pool: Arc<PgPool>,
}

impl PostgresAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn unavailable(err: sqlx::Error) -> AuditLogError {
    AuditLogError::Unavailable(err.to_string())
}

#[async_trait]
impl AuditLog for PostgresAuditLog {
    #[instrument(skip(self), err)]
    async fn max_id(&self) -> Result<Option<AuditId>, AuditLogError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM audit_log")
            .fetch_one(&*self.pool)
            .await
            .map_err(unavailable)?;
        Ok(max.map(AuditId::new))
    }

    #[instrument(skip(self), fields(after = after.get()), err)]
    async fn read_after(
        &self,
        after: AuditId,
        limit: Option<u32>,
    ) -> Result<Vec<AuditEvent>, AuditLogError> {
        // LIMIT NULL is "no limit" in Postgres.
        let rows = sqlx::query(
            r#"
            SELECT l.id, t.name AS entity_table, l.operation, l.record_id
            FROM audit_log l
            JOIN audit_table t ON t.id = l.table_id
            WHERE l.id > $1
            ORDER BY l.id ASC
            LIMIT $2
            "#,
        )
        .bind(after.get())
        .bind(limit.map(i64::from))
        .fetch_all(&*self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                let malformed = |e: sqlx::Error| AuditLogError::Malformed(e.to_string());
                Ok(AuditEvent::new(
                    row.try_get("id").map_err(malformed)?,
                    row.try_get::<String, _>("entity_table").map_err(malformed)?,
                    row.try_get::<String, _>("operation").map_err(malformed)?,
                    row.try_get("record_id").map_err(malformed)?,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_strictly_after_in_id_order() {
        let log = InMemoryAuditLog::new();
        log.append_with_id(10, "contact", "INSERT", 1);
        log.append_with_id(5, "contact", "UPDATE", 2);
        log.append_with_id(7, "project", "INSERT", 3);

        let ids: Vec<i64> = log
            .read_after(AuditId::new(5), None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id.get())
            .collect();
        assert_eq!(ids, vec![7, 10]);
        assert_eq!(log.max_id().await.unwrap(), Some(AuditId::new(10)));
    }

    #[tokio::test]
    async fn limit_caps_the_batch() {
        let log = InMemoryAuditLog::new();
        for record in 0..5 {
            log.append("contact", "INSERT", record);
        }
        let batch = log.read_after(AuditId::new(0), Some(2)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].id, AuditId::new(2));
    }

    #[tokio::test]
    async fn empty_log_has_no_tail() {
        assert_eq!(InMemoryAuditLog::new().max_id().await.unwrap(), None);
    }
}
