//! Redis Streams job broker (durable, at-least-once delivery).
//!
//! - **Stream**: one stream for every job (`ledgersync:jobs` by default)
//! - **Consumer group**: shared by every worker process; each entry goes to
//!   one consumer
//! - **Visibility timeout**: entries pending longer than the timeout are
//!   claimed by the next consumer that asks (`XPENDING IDLE` + `XCLAIM`)
//! - **Dead letters**: an entry claimed more than `max_deliveries` times is
//!   copied to `{stream}:dlq` and acknowledged
//!
//! Acks happen only when the worker calls [`JobBroker::ack`], after the
//! handler finished.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{instrument, warn};

use ledgersync_queue::{BrokerError, Delivery, JobBroker, JobEnvelope};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(3600);
const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Poisoned or exhausted entries moved aside per `reserve` call, at most.
const MAX_SKIPS_PER_RESERVE: usize = 16;

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub stream_key: String,
    pub group: String,
    pub dlq_key: String,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
}

impl RedisStreamsConfig {
    pub fn new(stream_key: impl Into<String>, group: impl Into<String>) -> Self {
        let stream_key = stream_key.into();
        Self {
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            group: group.into(),
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
}

/// One stream entry: id plus its field/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

enum Reclaim {
    Claimed(Delivery),
    /// Something was moved aside or lost to another consumer; look again.
    Skipped,
    Empty,
}

#[derive(Clone)]
pub struct RedisStreamsBroker {
    conn: MultiplexedConnection,
    config: RedisStreamsConfig,
}

fn connection(e: redis::RedisError) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

fn command(name: &str, e: redis::RedisError) -> BrokerError {
    BrokerError::Command(format!("{name} failed: {e}"))
}

impl RedisStreamsBroker {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(url: &str, config: RedisStreamsConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(connection)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(connection)?;
        let broker = Self { conn, config };
        broker.ensure_group().await?;
        Ok(broker)
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.config
    }

    async fn ensure_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command("XGROUP CREATE", e)),
        }
    }

    fn idle_ms(&self) -> u64 {
        u64::try_from(self.config.visibility_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    async fn reclaim_one(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> Result<Reclaim, BrokerError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(self.idle_ms())
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| command("XPENDING", e))?;

        let Some((id, _owner, _idle, deliveries)) = pending.into_iter().next() else {
            return Ok(Reclaim::Empty);
        };

        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(consumer)
            .arg(self.idle_ms())
            .arg(&id)
            .query_async(conn)
            .await
            .map_err(|e| command("XCLAIM", e))?;

        let entry = match bulk(&claimed)?.first() {
            Some(redis::Value::Nil) => {
                // Trimmed from the stream while pending.
                self.xack(conn, &id).await?;
                return Ok(Reclaim::Skipped);
            }
            Some(value) => parse_entry(value)?,
            // Another consumer claimed it first.
            None => return Ok(Reclaim::Skipped),
        };

        let count = u32::try_from(deliveries).unwrap_or(u32::MAX).saturating_add(1);
        if count > self.config.max_deliveries {
            self.dead_letter(conn, &entry, count - 1, "max deliveries exceeded")
                .await?;
            return Ok(Reclaim::Skipped);
        }

        match decode_envelope(&entry) {
            Ok(envelope) => Ok(Reclaim::Claimed(Delivery::new(entry.id, envelope, count))),
            Err(err) => {
                self.dead_letter(conn, &entry, count, &err.to_string()).await?;
                Ok(Reclaim::Skipped)
            }
        }
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.config.stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| command("XREADGROUP", e))?;

        let Some(entry) = first_stream_entry(&reply)? else {
            return Ok(None);
        };
        match decode_envelope(&entry) {
            Ok(envelope) => Ok(Some(Delivery::new(entry.id, envelope, 1))),
            Err(err) => {
                self.dead_letter(conn, &entry, 1, &err.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn xack(&self, conn: &mut MultiplexedConnection, id: &str) -> Result<(), BrokerError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(|e| command("XACK", e))?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        conn: &mut MultiplexedConnection,
        entry: &StreamEntry,
        deliveries: u32,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let payload = entry.fields.get("payload").map(String::as_str).unwrap_or("");
        let _: String = redis::cmd("XADD")
            .arg(&self.config.dlq_key)
            .arg("*")
            .arg("original_id")
            .arg(&entry.id)
            .arg("deliveries")
            .arg(deliveries)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(payload)
            .query_async(conn)
            .await
            .map_err(|e| command("DLQ XADD", e))?;
        self.xack(conn, &entry.id).await?;

        warn!(
            entry_id = %entry.id,
            deliveries,
            reason,
            dlq = %self.config.dlq_key,
            "job moved to dead-letter stream"
        );
        Ok(())
    }
}

#[async_trait]
impl JobBroker for RedisStreamsBroker {
    #[instrument(
        skip(self, job),
        fields(stream = %self.config.stream_key, job_id = %job.job_id(), handler = %job.handler()),
        err
    )]
    async fn publish(&self, job: &JobEnvelope) -> Result<(), BrokerError> {
        let payload =
            serde_json::to_string(job).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.config.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(job.job_id().to_string())
            .arg("handler")
            .arg(job.handler().as_str())
            .arg("audit_id")
            .arg(job.audit_id().get())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| command("XADD", e))?;
        Ok(())
    }

    async fn reserve(&self, consumer: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.conn.clone();
        for _ in 0..MAX_SKIPS_PER_RESERVE {
            match self.reclaim_one(&mut conn, consumer).await? {
                Reclaim::Claimed(delivery) => return Ok(Some(delivery)),
                Reclaim::Skipped => continue,
                Reclaim::Empty => break,
            }
        }
        self.read_new(&mut conn, consumer).await
    }

    #[instrument(skip(self, delivery), fields(entry_id = %delivery.tag()), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        self.xack(&mut conn, delivery.tag()).await
    }
}

fn malformed(what: &str) -> BrokerError {
    BrokerError::Deserialization(format!("malformed stream reply: {what}"))
}

fn bulk(value: &redis::Value) -> Result<&[redis::Value], BrokerError> {
    match value {
        redis::Value::Bulk(items) => Ok(items),
        redis::Value::Nil => Ok(&[]),
        _ => Err(malformed("expected an array")),
    }
}

fn text(value: &redis::Value) -> Result<String, BrokerError> {
    match value {
        redis::Value::Data(data) => Ok(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(status) => Ok(status.clone()),
        _ => Err(malformed("expected a string")),
    }
}

/// `[id, [field, value, ...]]`
fn parse_entry(value: &redis::Value) -> Result<StreamEntry, BrokerError> {
    let parts = bulk(value)?;
    let (Some(id), Some(pairs)) = (parts.first(), parts.get(1)) else {
        return Err(malformed("entry too short"));
    };

    let mut fields = HashMap::new();
    for pair in bulk(pairs)?.chunks(2) {
        if let [key, value] = pair {
            fields.insert(text(key)?, text(value)?);
        }
    }
    Ok(StreamEntry {
        id: text(id)?,
        fields,
    })
}

/// `XREADGROUP` reply: `[[stream, [entry, ...]], ...]`, or nil.
fn first_stream_entry(reply: &redis::Value) -> Result<Option<StreamEntry>, BrokerError> {
    let Some(stream) = bulk(reply)?.first() else {
        return Ok(None);
    };
    let Some(entries) = bulk(stream)?.get(1) else {
        return Ok(None);
    };
    bulk(entries)?.first().map(parse_entry).transpose()
}

fn decode_envelope(entry: &StreamEntry) -> Result<JobEnvelope, BrokerError> {
    let payload = entry
        .fields
        .get("payload")
        .ok_or_else(|| BrokerError::Deserialization(format!("entry {} has no payload", entry.id)))?;
    serde_json::from_str(payload).map_err(|e| BrokerError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_core::{AuditId, EntityKind, Operation, RouteKey};
    use ledgersync_queue::HandlerName;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, payload: &str) -> redis::Value {
        redis::Value::Bulk(vec![
            data(id),
            redis::Value::Bulk(vec![
                data("handler"),
                data("ledger.propagate"),
                data("payload"),
                data(payload),
            ]),
        ])
    }

    fn job() -> JobEnvelope {
        JobEnvelope::new(
            HandlerName::from_static("ledger.propagate"),
            RouteKey::entity(EntityKind::Contact, Operation::Insert),
            9,
            AuditId::new(12),
        )
    }

    #[test]
    fn read_group_replies_decode_into_envelopes() {
        let job = job();
        let payload = serde_json::to_string(&job).unwrap();
        let reply = redis::Value::Bulk(vec![redis::Value::Bulk(vec![
            data("ledgersync:jobs"),
            redis::Value::Bulk(vec![entry("1700000000000-0", &payload)]),
        ])]);

        let parsed = first_stream_entry(&reply).unwrap().unwrap();
        assert_eq!(parsed.id, "1700000000000-0");
        assert_eq!(decode_envelope(&parsed).unwrap(), job);
    }

    #[test]
    fn nil_replies_mean_nothing_ready() {
        assert_eq!(first_stream_entry(&redis::Value::Nil).unwrap(), None);
    }

    #[test]
    fn entries_without_payload_are_rejected() {
        let parsed = parse_entry(&redis::Value::Bulk(vec![
            data("1-0"),
            redis::Value::Bulk(vec![data("handler"), data("x")]),
        ]))
        .unwrap();
        assert!(matches!(
            decode_envelope(&parsed),
            Err(BrokerError::Deserialization(_))
        ));
    }

    #[test]
    fn dead_letter_stream_follows_the_job_stream() {
        let config = RedisStreamsConfig::new("ledgersync:jobs", "ledgersync-workers");
        assert_eq!(config.dlq_key, "ledgersync:jobs:dlq");
        assert_eq!(config.max_deliveries, 5);
    }
}
