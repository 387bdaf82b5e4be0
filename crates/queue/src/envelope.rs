use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledgersync_core::{AuditId, RouteKey};

/// Identifier of one enqueued job (UUIDv7, time-ordered).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Name a job handler is registered under on the worker side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerName(Cow<'static, str>);

impl HandlerName {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for HandlerName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Envelope for one job: which handler runs, for which audit row.
///
/// Notes:
/// - `record_id` is the only argument a handler receives.
/// - `audit_id` identifies the triggering change and keys idempotency markers;
///   a redelivered job carries the same `audit_id` as the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    job_id: JobId,
    handler: HandlerName,
    route: RouteKey,
    record_id: i64,
    audit_id: AuditId,
    enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(handler: HandlerName, route: RouteKey, record_id: i64, audit_id: AuditId) -> Self {
        Self {
            job_id: JobId::new(),
            handler,
            route,
            record_id,
            audit_id,
            enqueued_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn handler(&self) -> &HandlerName {
        &self.handler
    }

    pub fn route(&self) -> RouteKey {
        self.route
    }

    pub fn record_id(&self) -> i64 {
        self.record_id
    }

    pub fn audit_id(&self) -> AuditId {
        self.audit_id
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

/// A reserved job awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    tag: String,
    envelope: JobEnvelope,
    delivery_count: u32,
}

impl Delivery {
    pub fn new(tag: impl Into<String>, envelope: JobEnvelope, delivery_count: u32) -> Self {
        Self {
            tag: tag.into(),
            envelope,
            delivery_count,
        }
    }

    /// Broker-specific handle used to acknowledge this delivery.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn envelope(&self) -> &JobEnvelope {
        &self.envelope
    }

    /// 1 on first delivery, incremented on every redelivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
