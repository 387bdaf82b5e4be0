//! In-memory job broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use crate::broker::{BrokerError, JobBroker};
use crate::envelope::{Delivery, JobEnvelope};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(3600);
const DEFAULT_MAX_DELIVERIES: u32 = 5;

#[derive(Debug, Clone)]
struct Queued {
    tag: String,
    envelope: JobEnvelope,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    queued: Queued,
    consumer: String,
    visible_at: Instant,
}

/// A job that exhausted its deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub envelope: JobEnvelope,
    pub deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Queued>,
    in_flight: HashMap<String, InFlight>,
    dead_letters: Vec<DeadLetter>,
    published: Vec<JobEnvelope>,
    next_tag: u64,
    /// Successful publishes left before the next publish fails once.
    fail_publish_after: Option<usize>,
}

/// In-memory broker with visibility-timeout redelivery.
///
/// - No IO
/// - Unacknowledged reservations come back after `visibility_timeout`
/// - Jobs beyond `max_deliveries` move to the dead-letter list
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    visibility_timeout: Duration,
    max_deliveries: u32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max;
        self
    }

    /// Let `successes` more publishes through, then fail exactly one.
    pub fn fail_publish_after(&self, successes: usize) {
        self.lock().fail_publish_after = Some(successes);
    }

    /// Make every in-flight reservation visible again (as if its worker died
    /// and the visibility timeout elapsed).
    pub fn expire_in_flight(&self) {
        let mut state = self.lock();
        let expired: Vec<InFlight> = state.in_flight.drain().map(|(_, f)| f).collect();
        for flight in expired {
            state.ready.push_front(flight.queued);
        }
    }

    /// Every envelope ever accepted, in publish order.
    pub fn published(&self) -> Vec<JobEnvelope> {
        self.lock().published.clone()
    }

    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge every later assertion.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobBroker for InMemoryBroker {
    async fn publish(&self, job: &JobEnvelope) -> Result<(), BrokerError> {
        let mut state = self.lock();

        if let Some(remaining) = state.fail_publish_after {
            if remaining == 0 {
                state.fail_publish_after = None;
                return Err(BrokerError::Unavailable("injected publish failure".into()));
            }
            state.fail_publish_after = Some(remaining - 1);
        }

        state.next_tag += 1;
        let tag = format!("mem-{}", state.next_tag);
        state.ready.push_back(Queued {
            tag,
            envelope: job.clone(),
            deliveries: 0,
        });
        state.published.push(job.clone());
        Ok(())
    }

    async fn reserve(&self, consumer: &str) -> Result<Option<Delivery>, BrokerError> {
        let now = Instant::now();
        let mut state = self.lock();

        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in expired {
            if let Some(flight) = state.in_flight.remove(&tag) {
                state.ready.push_front(flight.queued);
            }
        }

        while let Some(mut queued) = state.ready.pop_front() {
            queued.deliveries += 1;
            if queued.deliveries > self.max_deliveries {
                warn!(
                    job_id = %queued.envelope.job_id(),
                    deliveries = queued.deliveries - 1,
                    "job exhausted its deliveries; dead-lettered"
                );
                state.dead_letters.push(DeadLetter {
                    envelope: queued.envelope,
                    deliveries: queued.deliveries - 1,
                });
                continue;
            }

            let delivery = Delivery::new(queued.tag.clone(), queued.envelope.clone(), queued.deliveries);
            state.in_flight.insert(
                queued.tag.clone(),
                InFlight {
                    queued,
                    consumer: consumer.to_string(),
                    visible_at: now + self.visibility_timeout,
                },
            );
            return Ok(Some(delivery));
        }

        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let holder = state
            .in_flight
            .get(delivery.tag())
            .map(|f| (f.queued.deliveries, f.consumer.clone()));

        match holder {
            Some((deliveries, _)) if deliveries == delivery.delivery_count() => {
                state.in_flight.remove(delivery.tag());
            }
            Some((_, owner)) => {
                // Redelivered to another consumer after a timeout; that
                // reservation owns the ack now.
                warn!(
                    tag = delivery.tag(),
                    owner = %owner,
                    "late ack for a redelivered job ignored"
                );
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::HandlerName;
    use ledgersync_core::{AuditId, EntityKind, Operation, RouteKey};

    fn job(audit_id: i64) -> JobEnvelope {
        JobEnvelope::new(
            HandlerName::from_static("test"),
            RouteKey::entity(EntityKind::PurchaseOrder, Operation::Insert),
            42,
            AuditId::new(audit_id),
        )
    }

    #[tokio::test]
    async fn acked_jobs_are_not_redelivered() {
        let broker = InMemoryBroker::new();
        broker.publish(&job(1)).await.unwrap();

        let delivery = broker.reserve("w1").await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count(), 1);
        broker.ack(&delivery).await.unwrap();

        broker.expire_in_flight();
        assert!(broker.reserve("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unacked_jobs_come_back_after_the_visibility_timeout() {
        let broker = InMemoryBroker::new().with_visibility_timeout(Duration::ZERO);
        broker.publish(&job(1)).await.unwrap();

        let first = broker.reserve("w1").await.unwrap().unwrap();
        let second = broker.reserve("w2").await.unwrap().unwrap();
        assert_eq!(first.envelope(), second.envelope());
        assert_eq!(second.delivery_count(), 2);
        assert!(second.is_redelivery());
    }

    #[tokio::test]
    async fn reservation_is_one_job_at_a_time() {
        let broker = InMemoryBroker::new();
        broker.publish(&job(1)).await.unwrap();
        broker.publish(&job(2)).await.unwrap();

        let _first = broker.reserve("w1").await.unwrap().unwrap();
        assert_eq!(broker.in_flight_len(), 1);
        assert_eq!(broker.ready_len(), 1);
    }

    #[tokio::test]
    async fn exhausted_jobs_are_dead_lettered() {
        let broker = InMemoryBroker::new()
            .with_visibility_timeout(Duration::ZERO)
            .with_max_deliveries(2);
        broker.publish(&job(1)).await.unwrap();

        assert!(broker.reserve("w1").await.unwrap().is_some());
        assert!(broker.reserve("w1").await.unwrap().is_some());
        assert!(broker.reserve("w1").await.unwrap().is_none());

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].deliveries, 2);
    }

    #[tokio::test]
    async fn injected_publish_failure_fires_once() {
        let broker = InMemoryBroker::new();
        broker.fail_publish_after(1);

        assert!(broker.publish(&job(1)).await.is_ok());
        assert!(broker.publish(&job(2)).await.is_err());
        assert!(broker.publish(&job(3)).await.is_ok());
        assert_eq!(broker.published().len(), 2);
    }
}
