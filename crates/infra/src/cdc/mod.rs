//! Change-data capture: audit-log reader, watermark persistence and the
//! poller that turns audit rows into jobs.

pub mod audit_log;
pub mod poller;
pub mod watermark;

pub use audit_log::{AuditLog, AuditLogError, InMemoryAuditLog, PostgresAuditLog};
pub use poller::{AuditLogPoller, CommitMode, CycleReport, PollerConfig, PollerError, StartPosition};
pub use watermark::{
    InMemoryWatermarkStore, PostgresWatermarkStore, WatermarkError, WatermarkStore,
};
