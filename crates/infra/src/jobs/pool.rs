//! Worker pool: bounded concurrency, prefetch of one, ack after completion.
//!
//! Each worker is a tokio task looping
//! `reserve → idempotency check → handler → record marker → ack`.
//! A handler error is logged and the delivery is left unacknowledged, so the
//! broker's visibility timeout governs redelivery. Nothing here retries.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ledgersync_queue::{BrokerError, Delivery, JobBroker};

use super::HandlerSet;
use super::idempotency::IdempotencyStore;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name for logging; workers are `{name}-{n}`.
    pub name: String,
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Sleep between empty reservations.
    pub idle_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            concurrency: 3,
            idle_backoff: Duration::from_millis(500),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_duplicate: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to one reserved delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded; the delivery was acknowledged.
    Completed(String),
    /// A marker showed the job already ran; acknowledged without running.
    Duplicate,
    /// Left unacknowledged for redelivery.
    Failed(String),
}

#[derive(Clone)]
pub struct WorkerPool {
    broker: Arc<dyn JobBroker>,
    handlers: Arc<HandlerSet>,
    idempotency: Arc<dyn IdempotencyStore>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn JobBroker>,
        handlers: HandlerSet,
        idempotency: Arc<dyn IdempotencyStore>,
    ) -> Self {
        Self {
            broker,
            handlers: Arc::new(handlers),
            idempotency,
            stats: Arc::new(Mutex::new(PoolStats::default())),
        }
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    pub fn stats(&self) -> PoolStats {
        self.lock_stats().clone()
    }

    fn lock_stats(&self) -> MutexGuard<'_, PoolStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve and fully process at most one job (for tests or synchronous use).
    ///
    /// `Ok(None)` when nothing was ready.
    pub async fn process_one(&self, consumer: &str) -> Result<Option<JobOutcome>, BrokerError> {
        let Some(delivery) = self.broker.reserve(consumer).await? else {
            return Ok(None);
        };
        let outcome = self.execute(consumer, &delivery).await;

        let mut stats = self.lock_stats();
        stats.jobs_processed += 1;
        match outcome {
            JobOutcome::Completed(_) => stats.jobs_succeeded += 1,
            JobOutcome::Duplicate => stats.jobs_duplicate += 1,
            JobOutcome::Failed(_) => stats.jobs_failed += 1,
        }
        Ok(Some(outcome))
    }

    async fn execute(&self, consumer: &str, delivery: &Delivery) -> JobOutcome {
        let job = delivery.envelope();
        let handler_name = job.handler();

        let Some(handler) = self.handlers.get(handler_name) else {
            error!(
                worker = consumer,
                handler = %handler_name,
                job_id = %job.job_id(),
                "no handler registered; leaving job for redelivery"
            );
            return JobOutcome::Failed(format!("no handler registered for {handler_name}"));
        };

        match self.idempotency.seen(handler_name, job.audit_id()).await {
            Ok(true) => {
                debug!(
                    worker = consumer,
                    handler = %handler_name,
                    audit_id = job.audit_id().get(),
                    "job already processed; acknowledging"
                );
                self.ack(consumer, delivery).await;
                return JobOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(worker = consumer, error = %err, "idempotency lookup failed");
                return JobOutcome::Failed(err.to_string());
            }
        }

        self.lock_stats().current_running += 1;
        let result = handler.handle(job).await;
        {
            let mut stats = self.lock_stats();
            stats.current_running = stats.current_running.saturating_sub(1);
        }

        match result {
            Ok(status) => {
                if let Err(err) = self.idempotency.record(handler_name, job.audit_id()).await {
                    warn!(
                        worker = consumer,
                        handler = %handler_name,
                        error = %err,
                        "failed to record idempotency marker"
                    );
                }
                self.ack(consumer, delivery).await;
                info!(
                    worker = consumer,
                    handler = %handler_name,
                    record_id = job.record_id(),
                    audit_id = job.audit_id().get(),
                    delivery = delivery.delivery_count(),
                    status = %status,
                    "job completed"
                );
                JobOutcome::Completed(status)
            }
            Err(err) => {
                error!(
                    worker = consumer,
                    handler = %handler_name,
                    record_id = job.record_id(),
                    audit_id = job.audit_id().get(),
                    delivery = delivery.delivery_count(),
                    error = %err,
                    "job failed; leaving unacknowledged for redelivery"
                );
                JobOutcome::Failed(err.to_string())
            }
        }
    }

    async fn ack(&self, consumer: &str, delivery: &Delivery) {
        // A lost ack means a redelivery, which the marker turns into a no-op.
        if let Err(err) = self.broker.ack(delivery).await {
            warn!(worker = consumer, tag = delivery.tag(), error = %err, "ack failed");
        }
    }

    /// Spawn `config.concurrency` worker tasks.
    pub fn spawn(self, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let started = Instant::now();

        info!(
            pool = %config.name,
            concurrency = config.concurrency,
            "worker pool started"
        );

        let joins = (1..=config.concurrency.max(1))
            .map(|n| {
                let pool = self.clone();
                let consumer = format!("{}-{}", config.name, n);
                let shutdown = shutdown_rx.clone();
                let idle = config.idle_backoff;
                tokio::spawn(async move { worker_loop(pool, consumer, shutdown, idle).await })
            })
            .collect();

        WorkerPoolHandle {
            name: config.name,
            shutdown: shutdown_tx,
            joins,
            pool: self,
            started,
        }
    }
}

async fn worker_loop(
    pool: WorkerPool,
    consumer: String,
    mut shutdown: watch::Receiver<bool>,
    idle: Duration,
) {
    debug!(worker = %consumer, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match pool.process_one(&consumer).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => error!(worker = %consumer, error = %err, "failed to reserve job"),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(idle) => {}
        }
    }
    debug!(worker = %consumer, "worker stopped");
}

/// Handle to control a running pool.
pub struct WorkerPoolHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    pool: WorkerPool,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop reserving new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                error!(pool = %self.name, error = %err, "worker task panicked");
            }
        }
        info!(pool = %self.name, "worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.pool.stats();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::idempotency::InMemoryIdempotencyStore;
    use crate::jobs::{HandlerError, JobHandler};
    use async_trait::async_trait;
    use ledgersync_core::{AuditId, EntityKind, Operation, RouteKey};
    use ledgersync_queue::{HandlerName, InMemoryBroker, JobEnvelope};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const COUNT: HandlerName = HandlerName::from_static("test.count");
    const FAIL: HandlerName = HandlerName::from_static("test.fail");

    #[derive(Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, job: &JobEnvelope) -> Result<String, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("counted {}", job.record_id()))
        }
    }

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        async fn handle(&self, job: &JobEnvelope) -> Result<String, HandlerError> {
            Err(HandlerError::UnsupportedRoute(job.route()))
        }
    }

    fn envelope(handler: HandlerName, audit_id: i64) -> JobEnvelope {
        JobEnvelope::new(
            handler,
            RouteKey::entity(EntityKind::Contact, Operation::Update),
            7,
            AuditId::new(audit_id),
        )
    }

    fn pool(broker: &Arc<InMemoryBroker>, calls: &Arc<AtomicUsize>) -> WorkerPool {
        let handlers = HandlerSet::new()
            .with(COUNT, Counting { calls: calls.clone() })
            .with(FAIL, Failing);
        WorkerPool::new(
            broker.clone(),
            handlers,
            Arc::new(InMemoryIdempotencyStore::new()),
        )
    }

    #[tokio::test]
    async fn successful_jobs_are_acknowledged() {
        let broker = Arc::new(InMemoryBroker::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = pool(&broker, &calls);
        broker.publish(&envelope(COUNT, 1)).await.unwrap();

        let outcome = pool.process_one("w1").await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed("counted 7".into())));
        assert_eq!(broker.in_flight_len(), 0);
        assert_eq!(pool.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn failed_jobs_stay_unacknowledged() {
        let broker = Arc::new(InMemoryBroker::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = pool(&broker, &calls);
        broker.publish(&envelope(FAIL, 1)).await.unwrap();

        let outcome = pool.process_one("w1").await.unwrap();
        assert!(matches!(outcome, Some(JobOutcome::Failed(_))));
        assert_eq!(broker.in_flight_len(), 1);
        assert_eq!(pool.stats().jobs_failed, 1);
    }

    #[tokio::test]
    async fn redelivered_jobs_run_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = pool(&broker, &calls);
        let job = envelope(COUNT, 1);
        broker.publish(&job).await.unwrap();
        broker.publish(&job).await.unwrap();

        pool.process_one("w1").await.unwrap();
        let second = pool.process_one("w1").await.unwrap();

        assert_eq!(second, Some(JobOutcome::Duplicate));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn unknown_handlers_are_not_acknowledged() {
        let broker = Arc::new(InMemoryBroker::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = pool(&broker, &calls);
        broker
            .publish(&envelope(HandlerName::from_static("test.missing"), 1))
            .await
            .unwrap();

        let outcome = pool.process_one("w1").await.unwrap();
        assert!(matches!(outcome, Some(JobOutcome::Failed(_))));
        assert_eq!(broker.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn empty_queue_reports_nothing() {
        let broker = Arc::new(InMemoryBroker::new());
        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(pool(&broker, &calls).process_one("w1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn spawned_pool_drains_the_queue_and_shuts_down() {
        let broker = Arc::new(InMemoryBroker::new());
        let calls = Arc::new(AtomicUsize::new(0));
        for audit_id in 1..=6 {
            broker.publish(&envelope(COUNT, audit_id)).await.unwrap();
        }

        let handle = pool(&broker, &calls).spawn(
            WorkerPoolConfig::default()
                .with_name("test")
                .with_concurrency(3)
                .with_idle_backoff(Duration::from_millis(5)),
        );

        for _ in 0..200 {
            if handle.stats().jobs_succeeded == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(handle.stats().jobs_succeeded, 6);
        handle.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(broker.ready_len(), 0);
        assert_eq!(broker.in_flight_len(), 0);
    }
}
