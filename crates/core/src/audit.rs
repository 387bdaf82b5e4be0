//! Audit-log event model and routing keys.
//!
//! Rows are written by storage-level triggers outside this workspace and read
//! strictly in ascending id order. The raw `entity_table`/`operation` strings
//! are kept on the event as written; [`AuditEvent::route_key`] lifts them into
//! the closed [`RouteKey`] space, and anything that does not lift is a routing
//! miss.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::entity::EntityKind;
use crate::error::DomainError;
use crate::id::AuditId;

/// Row-level change kinds plus the synthetic ingestion operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    /// Non-row-triggered ingestion event (e.g. a parsed log file landed).
    Create,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Create => "CREATE",
        }
    }
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            "CREATE" => Ok(Operation::Create),
            _ => Err(DomainError::unknown("operation", s)),
        }
    }
}

/// Source tables the audit log can report on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuditTable {
    Entity(EntityKind),
    /// Parsed log-file batches awaiting ingestion.
    PoLog,
    /// Staged webhook payloads awaiting reconciliation.
    InboundPayload,
}

impl AuditTable {
    pub const fn name(self) -> &'static str {
        match self {
            AuditTable::Entity(kind) => kind.table_name(),
            AuditTable::PoLog => "po_log",
            AuditTable::InboundPayload => "inbound_payload",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if let Some(kind) = EntityKind::from_table_name(name) {
            return Some(AuditTable::Entity(kind));
        }
        match name.trim().to_ascii_lowercase().as_str() {
            "po_log" => Some(AuditTable::PoLog),
            "inbound_payload" => Some(AuditTable::InboundPayload),
            _ => None,
        }
    }

    pub fn entity_kind(self) -> Option<EntityKind> {
        match self {
            AuditTable::Entity(kind) => Some(kind),
            _ => None,
        }
    }
}

impl core::fmt::Display for AuditTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for AuditTable {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AuditTable::from_name(&value).ok_or_else(|| DomainError::unknown("audit table", value))
    }
}

impl From<AuditTable> for String {
    fn from(value: AuditTable) -> Self {
        value.name().to_string()
    }
}

/// `(table, operation)` pair a route is registered under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    pub table: AuditTable,
    pub operation: Operation,
}

impl RouteKey {
    pub const fn new(table: AuditTable, operation: Operation) -> Self {
        Self { table, operation }
    }

    pub const fn entity(kind: EntityKind, operation: Operation) -> Self {
        Self::new(AuditTable::Entity(kind), operation)
    }
}

impl core::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.table, self.operation)
    }
}

/// One row of the audit log, as read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: AuditId,
    pub entity_table: String,
    pub operation: String,
    pub record_id: i64,
}

impl AuditEvent {
    pub fn new(
        id: i64,
        entity_table: impl Into<String>,
        operation: impl Into<String>,
        record_id: i64,
    ) -> Self {
        Self {
            id: AuditId::new(id),
            entity_table: entity_table.into(),
            operation: operation.into(),
            record_id,
        }
    }

    /// Lift the raw strings into a routing key; `None` means nothing can route it.
    pub fn route_key(&self) -> Option<RouteKey> {
        let table = AuditTable::from_name(&self.entity_table)?;
        let operation = self.operation.parse::<Operation>().ok()?;
        Some(RouteKey::new(table, operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_rows_lift_into_route_keys() {
        let event = AuditEvent::new(500_001, "purchase_order", "insert", 42);
        assert_eq!(
            event.route_key(),
            Some(RouteKey::entity(EntityKind::PurchaseOrder, Operation::Insert))
        );
    }

    #[test]
    fn synthetic_sources_lift_into_route_keys() {
        let event = AuditEvent::new(7, "po_log", "CREATE", 3);
        assert_eq!(
            event.route_key(),
            Some(RouteKey::new(AuditTable::PoLog, Operation::Create))
        );
    }

    #[test]
    fn unknown_tables_and_operations_do_not_lift() {
        assert_eq!(AuditEvent::new(1, "unknown_table", "INSERT", 1).route_key(), None);
        assert_eq!(AuditEvent::new(2, "contact", "TRUNCATE", 1).route_key(), None);
    }

    #[test]
    fn audit_table_serializes_as_its_name() {
        let json = serde_json::to_string(&AuditTable::Entity(EntityKind::Bill)).unwrap();
        assert_eq!(json, "\"xero_bill\"");
        let back: AuditTable = serde_json::from_str("\"po_log\"").unwrap();
        assert_eq!(back, AuditTable::PoLog);
    }
}
