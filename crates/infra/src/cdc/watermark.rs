//! Durable poller watermarks.
//!
//! A watermark is the highest audit id a named poller has finished
//! dispatching. Commits never move it backwards, so a late commit from a
//! stale process cannot rewind a newer one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use ledgersync_core::AuditId;

#[derive(Debug, thiserror::Error)]
#[error("watermark store unavailable: {0}")]
pub struct WatermarkError(pub String);

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<AuditId>, WatermarkError>;

    async fn commit(&self, name: &str, id: AuditId) -> Result<(), WatermarkError>;
}

#[async_trait]
impl<W> WatermarkStore for Arc<W>
where
    W: WatermarkStore + ?Sized,
{
    async fn load(&self, name: &str) -> Result<Option<AuditId>, WatermarkError> {
        (**self).load(name).await
    }

    async fn commit(&self, name: &str, id: AuditId) -> Result<(), WatermarkError> {
        (**self).commit(name, id).await
    }
}

#[derive(Debug, Default)]
struct State {
    marks: HashMap<String, AuditId>,
    fail_commits: bool,
    commits: usize,
}

#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    state: Mutex<State>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every commit fail until switched back.
    pub fn set_fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    /// Number of successful commits.
    pub fn commits(&self) -> usize {
        self.lock().commits
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self, name: &str) -> Result<Option<AuditId>, WatermarkError> {
        Ok(self.lock().marks.get(name).copied())
    }

    async fn commit(&self, name: &str, id: AuditId) -> Result<(), WatermarkError> {
        let mut state = self.lock();
        if state.fail_commits {
            return Err(WatermarkError("injected commit failure".into()));
        }
        let mark = state.marks.entry(name.to_string()).or_insert(id);
        *mark = (*mark).max(id);
        state.commits += 1;
        Ok(())
    }
}

/// Watermarks in `cdc_watermark (name PRIMARY KEY, last_id, updated_at)`.
#[derive(Debug, Clone)]
pub struct PostgresWatermarkStore {
    pool: Arc<PgPool>,
}

impl PostgresWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl WatermarkStore for PostgresWatermarkStore {
    #[instrument(skip(self), err)]
    async fn load(&self, name: &str) -> Result<Option<AuditId>, WatermarkError> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_id FROM cdc_watermark WHERE name = $1")
                .bind(name)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| WatermarkError(e.to_string()))?;
        Ok(last.map(AuditId::new))
    }

    #[instrument(skip(self), fields(id = id.get()), err)]
    async fn commit(&self, name: &str, id: AuditId) -> Result<(), WatermarkError> {
        sqlx::query(
            r#"
            INSERT INTO cdc_watermark (name, last_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name)
            DO UPDATE SET
                last_id = GREATEST(cdc_watermark.last_id, EXCLUDED.last_id),
                updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(id.get())
        .execute(&*self.pool)
        .await
        .map_err(|e| WatermarkError(e.to_string()))?;
        Ok(())
    }
}
