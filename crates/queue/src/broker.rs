//! Job broker abstraction (mechanics only).
//!
//! The broker is the hand-off between the audit-log poller and the worker
//! pool. Its contract is deliberately narrow:
//!
//! - **At-least-once**: a reserved job that is never acknowledged becomes
//!   visible again once the visibility timeout elapses, with its delivery
//!   count incremented. Handlers must tolerate running twice.
//! - **Prefetch of one**: `reserve` hands out at most one job per call, and a
//!   worker calls it again only after acknowledging (or abandoning) the last.
//! - **Ack after completion**: workers acknowledge only once the handler has
//!   finished; a crash mid-job therefore redelivers that exact job.
//! - **Dead letters**: a job whose delivery count exceeds the broker's limit is
//!   moved aside for an operator instead of being retried forever.
//! - **No ordering across workers**: two jobs for the same record may complete
//!   in either order once handed to concurrent workers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{Delivery, JobEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The broker refused the operation (e.g. injected fault, closed broker).
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Enqueue a job. Returns once the broker has durably accepted it.
    async fn publish(&self, job: &JobEnvelope) -> Result<(), BrokerError>;

    /// Reserve at most one job for `consumer`; `None` when nothing is ready.
    async fn reserve(&self, consumer: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a finished job so it is never redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> JobBroker for Arc<B>
where
    B: JobBroker + ?Sized,
{
    async fn publish(&self, job: &JobEnvelope) -> Result<(), BrokerError> {
        (**self).publish(job).await
    }

    async fn reserve(&self, consumer: &str) -> Result<Option<Delivery>, BrokerError> {
        (**self).reserve(consumer).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery).await
    }
}
