//! Process wiring for the poller and worker binaries.
//!
//! Every client (database pool, broker connection) is built once here and
//! passed down by reference; nothing below this layer looks up globals.

pub mod cli;
pub mod signal;

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::info;

use ledgersync_infra::broker::{RedisStreamsBroker, RedisStreamsConfig};
use ledgersync_infra::cdc::{AuditLogPoller, PostgresAuditLog, PostgresWatermarkStore};
use ledgersync_infra::config::{BrokerConfig, DatabaseConfig, SyncConfig};
use ledgersync_infra::jobs::{
    HandlerSet, IngestHandler, PostgresIdempotencyStore, PostgresOutbox, PostgresPayloadSource,
    PropagateHandler, RetractHandler, WorkerPool,
};
use ledgersync_infra::reconcile::ReconciliationEngine;
use ledgersync_infra::routing::{INGEST, PROPAGATE, RETRACT, TaskRegistry};
use ledgersync_infra::store::PostgresLedgerStore;
use ledgersync_queue::{HandlerName, InMemoryBroker, JobBroker};

/// Handlers every worker process runs.
pub const WORKER_HANDLERS: [HandlerName; 3] = [PROPAGATE, RETRACT, INGEST];

pub async fn connect_database(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
        .context("failed to connect to the ledger database")
}

pub async fn connect_broker(config: &BrokerConfig) -> anyhow::Result<Arc<dyn JobBroker>> {
    let streams = RedisStreamsConfig::new(&config.stream, &config.group)
        .with_visibility_timeout(config.visibility_timeout)
        .with_max_deliveries(config.max_deliveries);
    let broker = RedisStreamsBroker::connect(&config.url, streams)
        .await
        .context("failed to connect to the job broker")?;
    Ok(Arc::new(broker))
}

/// Default routes, checked against the handlers the workers run.
pub fn routing_table(broker: Arc<dyn JobBroker>) -> anyhow::Result<TaskRegistry> {
    let registry = TaskRegistry::with_default_routes(broker).context("invalid routing table")?;
    registry
        .validate_against(|name| WORKER_HANDLERS.contains(name))
        .context("invalid routing table")?;
    Ok(registry)
}

/// One `route -> handler` line per route.
pub fn format_routes(registry: &TaskRegistry) -> String {
    registry
        .routes()
        .into_iter()
        .map(|(route, handler)| format!("{:<32} -> {handler}\n", route.to_string()))
        .collect()
}

pub fn print_routes() -> anyhow::Result<()> {
    // The table is static; nothing is published from here.
    let registry = routing_table(Arc::new(InMemoryBroker::new()))?;
    print!("{}", format_routes(&registry));
    Ok(())
}

pub async fn run_poller(config: SyncConfig) -> anyhow::Result<()> {
    let pool = connect_database(&config.database).await?;
    let broker = connect_broker(&config.broker).await?;
    let registry = routing_table(broker)?;

    let mut poller = AuditLogPoller::new(
        config.poller.clone(),
        Arc::new(PostgresAuditLog::new(pool.clone())),
        Arc::new(PostgresWatermarkStore::new(pool)),
        Arc::new(registry),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        signal::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    poller
        .run(shutdown_rx)
        .await
        .context("poller failed to start")?;
    Ok(())
}

pub async fn run_worker(config: SyncConfig, concurrency: Option<usize>) -> anyhow::Result<()> {
    let resolver = config.resolver().context("invalid resolver defaults")?;
    let pool = connect_database(&config.database).await?;
    let broker = connect_broker(&config.broker).await?;

    let store = Arc::new(PostgresLedgerStore::new(pool.clone()));
    let engine = Arc::new(ReconciliationEngine::new(store, resolver));
    let outbox = Arc::new(PostgresOutbox::new(pool.clone()));

    let handlers = HandlerSet::new()
        .with(PROPAGATE, PropagateHandler::new(engine.clone(), outbox.clone()))
        .with(RETRACT, RetractHandler::new(outbox))
        .with(
            INGEST,
            IngestHandler::new(engine, Arc::new(PostgresPayloadSource::new(pool.clone()))),
        );
    for name in &WORKER_HANDLERS {
        anyhow::ensure!(handlers.contains(name), "handler {name} is not wired");
    }

    let mut worker_config = config.worker.clone();
    if let Some(n) = concurrency {
        worker_config = worker_config.with_concurrency(n);
    }

    let handle = WorkerPool::new(
        broker,
        handlers,
        Arc::new(PostgresIdempotencyStore::new(pool)),
    )
    .spawn(worker_config);

    signal::shutdown_signal().await;
    info!(stats = ?handle.stats(), "draining in-flight jobs");
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_validates_against_worker_handlers() {
        let registry = routing_table(Arc::new(InMemoryBroker::new())).unwrap();
        let table = format_routes(&registry);

        assert_eq!(table.lines().count(), registry.len());
        assert!(table.contains("po_log/CREATE"));
        assert!(table.contains("-> ledger.ingest"));
    }
}
