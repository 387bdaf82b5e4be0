//! Identifiers and event vocabulary shared by every crate.
//!
//! This crate contains **pure** primitives (no I/O, no async).

pub mod audit;
pub mod entity;
pub mod error;
pub mod id;

pub use audit::{AuditEvent, AuditTable, Operation, RouteKey};
pub use entity::EntityKind;
pub use error::{DomainError, DomainResult};
pub use id::{AuditId, ExternalId, SurrogateId};
