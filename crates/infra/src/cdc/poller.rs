//! The CDC driver: audit rows in, jobs out.
//!
//! One poller instance per audit log is assumed; nothing here takes a lock
//! against a second instance.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use ledgersync_core::{AuditEvent, AuditId, DomainError};

use super::audit_log::{AuditLog, AuditLogError};
use super::watermark::{WatermarkError, WatermarkStore};
use crate::routing::{DispatchError, TaskRegistry};

/// When the watermark is persisted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Once per cycle, after every row of the batch dispatched.
    #[default]
    Batch,
    /// After every row.
    Row,
}

impl FromStr for CommitMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(CommitMode::Batch),
            "row" => Ok(CommitMode::Row),
            _ => Err(DomainError::unknown("watermark commit mode", s)),
        }
    }
}

/// Where a fresh poller starts reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// The stored watermark; the audit tail when nothing is stored yet.
    #[default]
    Committed,
    /// The audit tail, ignoring any stored watermark.
    AuditTail,
}

impl FromStr for StartPosition {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "committed" => Ok(StartPosition::Committed),
            "audit-tail" | "audit_tail" => Ok(StartPosition::AuditTail),
            _ => Err(DomainError::unknown("watermark start position", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Watermark key.
    pub name: String,
    pub interval: Duration,
    /// Max rows per cycle; `None` reads everything past the watermark.
    pub batch_limit: Option<u32>,
    /// Rows at or below this id are never dispatched.
    pub floor: AuditId,
    pub commit: CommitMode,
    pub start: StartPosition,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            name: "audit-log".to_string(),
            interval: Duration::from_secs(2),
            batch_limit: None,
            floor: AuditId::new(0),
            commit: CommitMode::Batch,
            start: StartPosition::Committed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error(transparent)]
    AuditLog(#[from] AuditLogError),

    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub dispatched: usize,
    /// Rows with no route; skipped, never retried.
    pub missed: usize,
    /// `last_processed_id` after the cycle.
    pub watermark: AuditId,
}

pub struct AuditLogPoller {
    config: PollerConfig,
    log: Arc<dyn AuditLog>,
    watermarks: Arc<dyn WatermarkStore>,
    registry: Arc<TaskRegistry>,
    last_processed: Option<AuditId>,
}

impl AuditLogPoller {
    pub fn new(
        config: PollerConfig,
        log: Arc<dyn AuditLog>,
        watermarks: Arc<dyn WatermarkStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            config,
            log,
            watermarks,
            registry,
            last_processed: None,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// In-process watermark; `None` before the first cycle.
    pub fn last_processed(&self) -> Option<AuditId> {
        self.last_processed
    }

    /// Compute the start position, `max(start, floor)`, and commit it so a
    /// restart before the first cycle resumes from the same place.
    pub async fn start(&mut self) -> Result<AuditId, PollerError> {
        let stored = match self.config.start {
            StartPosition::Committed => self.watermarks.load(&self.config.name).await?,
            StartPosition::AuditTail => None,
        };
        let start = match stored {
            Some(id) => id,
            None => self.log.max_id().await?.unwrap_or(AuditId::new(0)),
        };
        let start = start.max(self.config.floor);
        if stored != Some(start) {
            self.watermarks.commit(&self.config.name, start).await?;
        }

        info!(
            poller = %self.config.name,
            stored = stored.map(AuditId::get),
            floor = self.config.floor.get(),
            start = start.get(),
            "poller starting"
        );
        self.last_processed = Some(start);
        Ok(start)
    }

    /// Read and dispatch every row past the watermark once.
    ///
    /// On error the in-process watermark stays where the last commit left
    /// it, so the next cycle re-reads the uncommitted range.
    pub async fn poll_once(&mut self) -> Result<CycleReport, PollerError> {
        let from = match self.last_processed {
            Some(id) => id,
            None => self.start().await?,
        };
        let rows = self.log.read_after(from, self.config.batch_limit).await?;

        let mut report = CycleReport {
            dispatched: 0,
            missed: 0,
            watermark: from,
        };
        let mut cursor = from;

        for row in &rows {
            if self.dispatch_row(row).await? {
                report.dispatched += 1;
            } else {
                report.missed += 1;
            }
            cursor = cursor.max(row.id);

            if self.config.commit == CommitMode::Row {
                self.watermarks.commit(&self.config.name, cursor).await?;
                self.last_processed = Some(cursor);
            }
        }

        if self.config.commit == CommitMode::Batch && cursor > from {
            self.watermarks.commit(&self.config.name, cursor).await?;
            self.last_processed = Some(cursor);
        }

        report.watermark = cursor;
        Ok(report)
    }

    async fn dispatch_row(&self, row: &AuditEvent) -> Result<bool, DispatchError> {
        let routed = self.registry.dispatch(row).await?;
        if routed {
            info!(
                audit_id = row.id.get(),
                table = %row.entity_table,
                operation = %row.operation,
                record_id = row.record_id,
                "dispatched"
            );
        } else {
            warn!(
                audit_id = row.id.get(),
                table = %row.entity_table,
                operation = %row.operation,
                record_id = row.record_id,
                "no route; skipping"
            );
        }
        Ok(routed)
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Only a failure to compute the start position is returned; cycle
    /// errors are logged and retried after the interval.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PollerError> {
        if self.last_processed.is_none() {
            self.start().await?;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut full_batch = false;
            match self.poll_once().await {
                Ok(report) => {
                    let read = report.dispatched + report.missed;
                    full_batch = self
                        .config
                        .batch_limit
                        .is_some_and(|limit| read >= limit as usize && read > 0);
                }
                Err(err) => {
                    error!(
                        poller = %self.config.name,
                        watermark = self.last_processed.map(AuditId::get),
                        error = %err,
                        "poll cycle failed; retrying uncommitted rows next cycle"
                    );
                }
            }

            if full_batch {
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!(
            poller = %self.config.name,
            watermark = self.last_processed.map(AuditId::get),
            "poller stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::audit_log::InMemoryAuditLog;
    use crate::cdc::watermark::InMemoryWatermarkStore;
    use ledgersync_core::{EntityKind, Operation, RouteKey};
    use ledgersync_queue::InMemoryBroker;

    struct Fixture {
        log: Arc<InMemoryAuditLog>,
        watermarks: Arc<InMemoryWatermarkStore>,
        broker: Arc<InMemoryBroker>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                log: Arc::new(InMemoryAuditLog::new()),
                watermarks: Arc::new(InMemoryWatermarkStore::new()),
                broker: Arc::new(InMemoryBroker::new()),
            }
        }

        fn poller(&self, config: PollerConfig) -> AuditLogPoller {
            let registry = TaskRegistry::with_default_routes(self.broker.clone()).unwrap();
            AuditLogPoller::new(
                config,
                self.log.clone(),
                self.watermarks.clone(),
                Arc::new(registry),
            )
        }

        async fn committed(&self) -> Option<AuditId> {
            self.watermarks.load("audit-log").await.unwrap()
        }
    }

    #[tokio::test]
    async fn dispatches_a_new_row_and_advances_the_watermark() {
        let fx = Fixture::new();
        fx.watermarks
            .commit("audit-log", AuditId::new(500_000))
            .await
            .unwrap();
        fx.log.append_with_id(500_001, "purchase_order", "INSERT", 42);

        let mut poller = fx.poller(PollerConfig::default());
        let report = poller.poll_once().await.unwrap();

        assert_eq!(report.dispatched, 1);
        assert_eq!(report.watermark, AuditId::new(500_001));
        assert_eq!(fx.committed().await, Some(AuditId::new(500_001)));

        let published = fx.broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].record_id(), 42);
        assert_eq!(
            published[0].route(),
            RouteKey::entity(EntityKind::PurchaseOrder, Operation::Insert)
        );
    }

    #[tokio::test]
    async fn routing_misses_are_skipped_but_still_advance() {
        let fx = Fixture::new();
        fx.watermarks.commit("audit-log", AuditId::new(0)).await.unwrap();
        fx.log.append("unknown_table", "INSERT", 1);
        fx.log.append("contact", "INSERT", 2);

        let mut poller = fx.poller(PollerConfig::default());
        let report = poller.poll_once().await.unwrap();

        assert_eq!(report.missed, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(fx.committed().await, Some(AuditId::new(2)));
    }

    #[tokio::test]
    async fn batch_mode_redispatches_the_whole_batch_after_a_failure() {
        let fx = Fixture::new();
        fx.watermarks.commit("audit-log", AuditId::new(500)).await.unwrap();
        for id in 501..=510 {
            fx.log.append_with_id(id, "detail_item", "UPDATE", id);
        }
        fx.broker.fail_publish_after(7);

        let mut poller = fx.poller(PollerConfig::default());
        let err = poller.poll_once().await.unwrap_err();
        assert!(matches!(err, PollerError::Dispatch(ref d) if d.audit_id == 508));
        assert_eq!(poller.last_processed(), Some(AuditId::new(500)));
        assert_eq!(fx.committed().await, Some(AuditId::new(500)));

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.dispatched, 10);
        assert_eq!(fx.committed().await, Some(AuditId::new(510)));

        let record_ids: Vec<i64> = fx.broker.published().iter().map(|j| j.record_id()).collect();
        assert_eq!(record_ids.len(), 17);
        assert_eq!(&record_ids[..7], &[501, 502, 503, 504, 505, 506, 507]);
        assert_eq!(&record_ids[7..], &(501..=510).collect::<Vec<_>>()[..]);
    }

    #[tokio::test]
    async fn row_mode_only_retries_from_the_failing_row() {
        let fx = Fixture::new();
        fx.watermarks.commit("audit-log", AuditId::new(500)).await.unwrap();
        for id in 501..=510 {
            fx.log.append_with_id(id, "detail_item", "UPDATE", id);
        }
        fx.broker.fail_publish_after(7);

        let mut poller = fx.poller(PollerConfig {
            commit: CommitMode::Row,
            ..PollerConfig::default()
        });
        assert!(poller.poll_once().await.is_err());
        assert_eq!(poller.last_processed(), Some(AuditId::new(507)));
        assert_eq!(fx.committed().await, Some(AuditId::new(507)));

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.dispatched, 3);
        assert_eq!(fx.broker.published().len(), 10);
    }

    #[tokio::test]
    async fn floor_skips_the_backlog() {
        let fx = Fixture::new();
        fx.watermarks.commit("audit-log", AuditId::new(3)).await.unwrap();
        for record in 1..=10 {
            fx.log.append("contact", "UPDATE", record);
        }

        let mut poller = fx.poller(PollerConfig {
            floor: AuditId::new(8),
            ..PollerConfig::default()
        });
        assert_eq!(poller.start().await.unwrap(), AuditId::new(8));
        assert_eq!(poller.poll_once().await.unwrap().dispatched, 2);
    }

    #[tokio::test]
    async fn cold_start_begins_at_the_audit_tail() {
        let fx = Fixture::new();
        fx.log.append("contact", "INSERT", 1);
        fx.log.append("contact", "INSERT", 2);

        let mut poller = fx.poller(PollerConfig::default());
        assert_eq!(poller.poll_once().await.unwrap().dispatched, 0);

        fx.log.append("contact", "UPDATE", 1);
        assert_eq!(poller.poll_once().await.unwrap().dispatched, 1);
    }

    #[tokio::test]
    async fn cold_start_position_survives_a_restart() {
        let fx = Fixture::new();
        fx.log.append("contact", "INSERT", 1);
        fx.log.append("contact", "INSERT", 2);

        let mut first = fx.poller(PollerConfig::default());
        assert_eq!(first.start().await.unwrap(), AuditId::new(2));
        assert_eq!(fx.committed().await, Some(AuditId::new(2)));
        drop(first);

        // Appended while no poller was running.
        fx.log.append("contact", "UPDATE", 1);
        fx.log.append("contact", "UPDATE", 2);

        let mut restarted = fx.poller(PollerConfig::default());
        assert_eq!(restarted.start().await.unwrap(), AuditId::new(2));
        assert_eq!(restarted.poll_once().await.unwrap().dispatched, 2);
    }

    #[tokio::test]
    async fn resuming_at_the_stored_watermark_does_not_recommit() {
        let fx = Fixture::new();
        fx.watermarks.commit("audit-log", AuditId::new(5)).await.unwrap();

        fx.poller(PollerConfig::default()).start().await.unwrap();
        assert_eq!(fx.watermarks.commits(), 1);
    }

    #[tokio::test]
    async fn audit_tail_start_ignores_the_stored_watermark() {
        let fx = Fixture::new();
        fx.watermarks.commit("audit-log", AuditId::new(1)).await.unwrap();
        for record in 1..=4 {
            fx.log.append("contact", "INSERT", record);
        }

        let mut poller = fx.poller(PollerConfig {
            start: StartPosition::AuditTail,
            ..PollerConfig::default()
        });
        assert_eq!(poller.start().await.unwrap(), AuditId::new(4));
    }

    #[tokio::test]
    async fn restart_resumes_from_the_committed_watermark() {
        let fx = Fixture::new();
        fx.watermarks.commit("audit-log", AuditId::new(0)).await.unwrap();
        fx.log.append("project", "INSERT", 1);
        fx.poller(PollerConfig::default()).poll_once().await.unwrap();

        fx.log.append("project", "UPDATE", 1);
        let mut restarted = fx.poller(PollerConfig::default());
        assert_eq!(restarted.start().await.unwrap(), AuditId::new(1));
        assert_eq!(restarted.poll_once().await.unwrap().dispatched, 1);
        assert_eq!(fx.broker.published().len(), 2);
    }

    #[tokio::test]
    async fn read_failures_keep_the_watermark() {
        let fx = Fixture::new();
        fx.watermarks.commit("audit-log", AuditId::new(0)).await.unwrap();
        fx.log.append("contact", "INSERT", 1);
        let mut poller = fx.poller(PollerConfig::default());
        poller.start().await.unwrap();

        fx.log.fail_next_read();
        assert!(matches!(
            poller.poll_once().await,
            Err(PollerError::AuditLog(_))
        ));
        assert_eq!(poller.poll_once().await.unwrap().dispatched, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fx = Fixture::new();
        fx.watermarks.commit("audit-log", AuditId::new(0)).await.unwrap();
        fx.log.append("contact", "INSERT", 1);

        let mut poller = fx.poller(PollerConfig {
            interval: Duration::from_millis(10),
            ..PollerConfig::default()
        });
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            poller.run(rx).await.unwrap();
            poller.last_processed()
        });

        for _ in 0..100 {
            if !fx.broker.published().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), Some(AuditId::new(1)));
    }

    #[test]
    fn modes_parse_from_config_strings() {
        assert_eq!("row".parse::<CommitMode>().unwrap(), CommitMode::Row);
        assert_eq!(
            "audit-tail".parse::<StartPosition>().unwrap(),
            StartPosition::AuditTail
        );
        assert!("sometimes".parse::<CommitMode>().is_err());
    }
}
