//! Job execution: handlers, the worker pool and idempotency markers.
//!
//! A handler receives one job envelope (its `record_id` plus the route it
//! came from) and returns a human-readable status or an error. An error
//! leaves the delivery unacknowledged so the broker redelivers it; handlers
//! must therefore be safe to run twice for the same record.

pub mod handlers;
pub mod idempotency;
pub mod pool;
pub mod ports;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use ledgersync_core::RouteKey;
use ledgersync_queue::{HandlerName, JobEnvelope};

use crate::reconcile::ReconcileError;
use crate::store::StoreError;

pub use handlers::{IngestHandler, PropagateHandler, RetractHandler};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore};
pub use postgres::{PostgresOutbox, PostgresPayloadSource};
pub use pool::{JobOutcome, PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use ports::{
    CollaboratorError, InMemoryPayloadSource, InboundPayload, IngestAction, PayloadSource,
    Propagator, RecordingPropagator, StagedPayload, UndecodablePayload,
};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("route {0} is not handled here")]
    UnsupportedRoute(RouteKey),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobEnvelope) -> Result<String, HandlerError>;
}

/// Handlers a worker process can run, by name.
#[derive(Default, Clone)]
pub struct HandlerSet {
    handlers: HashMap<HandlerName, Arc<dyn JobHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: HandlerName, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(name, Arc::new(handler));
        self
    }

    pub fn get(&self, name: &HandlerName) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &HandlerName) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &HandlerName> {
        self.handlers.keys()
    }
}
