//! Job queue contract shared by the poller (producer) and workers (consumers).

pub mod broker;
pub mod envelope;
pub mod in_memory;

pub use broker::{BrokerError, JobBroker};
pub use envelope::{Delivery, HandlerName, JobEnvelope, JobId};
pub use in_memory::{DeadLetter, InMemoryBroker};
