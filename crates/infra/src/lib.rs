//! Infrastructure layer: storage, reconciliation, routing, jobs and the CDC
//! poller, with in-memory and Postgres/Redis implementations.

pub mod broker;
pub mod cdc;
pub mod config;
pub mod jobs;
pub mod reconcile;
pub mod routing;
pub mod store;
