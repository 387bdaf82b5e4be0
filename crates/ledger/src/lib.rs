//! Ledger entity model: schemas, states, payloads.
//!
//! This crate describes *what* gets reconciled, implemented purely as
//! deterministic data and validation (no IO, no storage, no async).

pub mod amount;
pub mod entities;
pub mod payload;
pub mod row;
pub mod schema;
pub mod state;
pub mod value;

pub use amount::Amount;
pub use entities::{
    BankTransactionPayload, BillPayload, ContactPayload, DetailItemPayload, EntityPayload,
    PurchaseOrderPayload,
};
pub use payload::{NormalizedPayload, Payload};
pub use row::EntityRow;
pub use schema::{
    ColumnType, DependencyPolicy, DependencySpec, EntitySchema, FieldSpec, FieldType,
    dependency_depth, schema, soft_dependencies,
};
pub use state::{
    BankTransactionState, DetailItemState, DocumentReviewStatus, LedgerDocumentState, ProjectStatus, PurchaseOrderState,
    VendorStatus,
};
pub use value::{FieldChanges, FieldValue};
