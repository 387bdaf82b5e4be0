//! Task registry: `(audit table, operation)` to job handler.
//!
//! The registry is pure data plus one side effect, enqueueing a job on the
//! injected broker. Routes are registered at boot; a duplicate registration
//! is a configuration error, and [`TaskRegistry::validate_against`] checks
//! every route names a handler the workers actually run.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use ledgersync_core::{AuditEvent, AuditTable, EntityKind, Operation, RouteKey};
use ledgersync_queue::{BrokerError, HandlerName, JobBroker, JobEnvelope};

/// Pushes an entity change out to the external systems of record.
pub const PROPAGATE: HandlerName = HandlerName::from_static("ledger.propagate");

/// Tells the external systems an entity row is gone.
pub const RETRACT: HandlerName = HandlerName::from_static("ledger.retract");

/// Applies staged inbound payloads through the reconciliation engine.
pub const INGEST: HandlerName = HandlerName::from_static("ledger.ingest");

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("route {route} registered twice ({existing} and {attempted})")]
    DuplicateRoute {
        route: RouteKey,
        existing: HandlerName,
        attempted: HandlerName,
    },

    #[error("route {route} names handler {handler}, which no worker provides")]
    UnknownHandler { route: RouteKey, handler: HandlerName },
}

#[derive(Debug, thiserror::Error)]
#[error("failed to dispatch audit row {audit_id} ({route}, record {record_id}): {source}")]
pub struct DispatchError {
    pub audit_id: i64,
    pub route: RouteKey,
    pub record_id: i64,
    #[source]
    pub source: BrokerError,
}

pub struct TaskRegistry {
    routes: HashMap<RouteKey, HandlerName>,
    broker: Arc<dyn JobBroker>,
}

impl TaskRegistry {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self {
            routes: HashMap::new(),
            broker,
        }
    }

    /// Registry holding the standard routes:
    ///
    /// - every entity table on INSERT/UPDATE → [`PROPAGATE`]
    /// - every entity table on DELETE → [`RETRACT`]
    /// - `po_log` CREATE and `inbound_payload` INSERT → [`INGEST`]
    pub fn with_default_routes(broker: Arc<dyn JobBroker>) -> Result<Self, RegistryError> {
        let mut registry = Self::new(broker);
        for kind in EntityKind::ALL {
            let table = AuditTable::Entity(kind);
            registry.register(table, Operation::Insert, PROPAGATE)?;
            registry.register(table, Operation::Update, PROPAGATE)?;
            registry.register(table, Operation::Delete, RETRACT)?;
        }
        registry.register(AuditTable::PoLog, Operation::Create, INGEST)?;
        registry.register(AuditTable::InboundPayload, Operation::Insert, INGEST)?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        table: AuditTable,
        operation: Operation,
        handler: HandlerName,
    ) -> Result<(), RegistryError> {
        let route = RouteKey::new(table, operation);
        if let Some(existing) = self.routes.get(&route) {
            return Err(RegistryError::DuplicateRoute {
                route,
                existing: existing.clone(),
                attempted: handler,
            });
        }
        self.routes.insert(route, handler);
        Ok(())
    }

    pub fn lookup(&self, route: &RouteKey) -> Option<&HandlerName> {
        self.routes.get(route)
    }

    /// Every route, sorted for display.
    pub fn routes(&self) -> Vec<(RouteKey, &HandlerName)> {
        let mut routes: Vec<_> = self.routes.iter().map(|(k, h)| (*k, h)).collect();
        routes.sort_by_key(|(route, _)| route.to_string());
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Fail unless every routed handler satisfies `provided`.
    pub fn validate_against(
        &self,
        provided: impl Fn(&HandlerName) -> bool,
    ) -> Result<(), RegistryError> {
        for (route, handler) in self.routes() {
            if !provided(handler) {
                return Err(RegistryError::UnknownHandler {
                    route,
                    handler: handler.clone(),
                });
            }
        }
        Ok(())
    }

    /// Enqueue the job routed for `event`; `Ok(false)` when no route exists.
    pub async fn dispatch(&self, event: &AuditEvent) -> Result<bool, DispatchError> {
        let Some(route) = event.route_key() else {
            return Ok(false);
        };
        let Some(handler) = self.lookup(&route) else {
            return Ok(false);
        };

        let job = JobEnvelope::new(handler.clone(), route, event.record_id, event.id);
        self.broker
            .publish(&job)
            .await
            .map_err(|source| DispatchError {
                audit_id: event.id.get(),
                route,
                record_id: event.record_id,
                source,
            })?;

        debug!(
            audit_id = event.id.get(),
            route = %route,
            handler = %handler,
            job_id = %job.job_id(),
            "job enqueued"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_queue::InMemoryBroker;

    fn registry() -> (Arc<InMemoryBroker>, TaskRegistry) {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = TaskRegistry::with_default_routes(broker.clone()).unwrap();
        (broker, registry)
    }

    #[test]
    fn default_routes_cover_every_entity_and_ingestion_source() {
        let (_, registry) = registry();
        assert_eq!(registry.len(), EntityKind::ALL.len() * 3 + 2);
        assert_eq!(
            registry.lookup(&RouteKey::entity(EntityKind::PurchaseOrder, Operation::Insert)),
            Some(&PROPAGATE)
        );
        assert_eq!(
            registry.lookup(&RouteKey::entity(EntityKind::Bill, Operation::Delete)),
            Some(&RETRACT)
        );
        assert_eq!(
            registry.lookup(&RouteKey::new(AuditTable::PoLog, Operation::Create)),
            Some(&INGEST)
        );
        assert_eq!(
            registry.lookup(&RouteKey::new(AuditTable::PoLog, Operation::Insert)),
            None
        );
    }

    #[test]
    fn duplicate_routes_are_rejected() {
        let (_, mut registry) = registry();
        let err = registry
            .register(AuditTable::PoLog, Operation::Create, PROPAGATE)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRoute { .. }));
    }

    #[test]
    fn validation_names_the_missing_handler() {
        let (_, registry) = registry();
        let err = registry
            .validate_against(|h| *h != INGEST)
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnknownHandler { ref handler, .. } if *handler == INGEST
        ));
        assert!(registry.validate_against(|_| true).is_ok());
    }

    #[tokio::test]
    async fn dispatch_enqueues_the_routed_handler() {
        let (broker, registry) = registry();
        let event = AuditEvent::new(500_001, "purchase_order", "INSERT", 42);

        assert!(registry.dispatch(&event).await.unwrap());

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].handler(), &PROPAGATE);
        assert_eq!(published[0].record_id(), 42);
        assert_eq!(published[0].audit_id().get(), 500_001);
    }

    #[tokio::test]
    async fn invoice_and_receipt_changes_are_routed() {
        let (broker, registry) = registry();
        for table in ["invoice", "receipt"] {
            assert!(registry.dispatch(&AuditEvent::new(1, table, "INSERT", 10)).await.unwrap());
            assert!(registry.dispatch(&AuditEvent::new(2, table, "UPDATE", 10)).await.unwrap());
            assert!(registry.dispatch(&AuditEvent::new(3, table, "DELETE", 10)).await.unwrap());
        }

        let handlers: Vec<_> = broker.published().iter().map(|j| j.handler().clone()).collect();
        assert_eq!(
            handlers,
            [PROPAGATE, PROPAGATE, RETRACT, PROPAGATE, PROPAGATE, RETRACT]
        );
        assert_eq!(
            registry.lookup(&RouteKey::entity(EntityKind::Receipt, Operation::Delete)),
            Some(&RETRACT)
        );
    }

    #[tokio::test]
    async fn unknown_tables_and_operations_are_misses() {
        let (broker, registry) = registry();
        let unknown_table = AuditEvent::new(1, "unknown_table", "INSERT", 1);
        let unknown_operation = AuditEvent::new(2, "purchase_order", "TRUNCATE", 1);
        let unrouted = AuditEvent::new(3, "po_log", "DELETE", 1);

        assert!(!registry.dispatch(&unknown_table).await.unwrap());
        assert!(!registry.dispatch(&unknown_operation).await.unwrap());
        assert!(!registry.dispatch(&unrouted).await.unwrap());
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn broker_failures_surface_as_dispatch_errors() {
        let (broker, registry) = registry();
        broker.fail_publish_after(0);
        let event = AuditEvent::new(7, "contact", "UPDATE", 3);

        let err = registry.dispatch(&event).await.unwrap_err();
        assert_eq!(err.audit_id, 7);
        assert_eq!(err.record_id, 3);
    }
}
