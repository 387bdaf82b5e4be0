//! Declarative entity schemas.
//!
//! One static [`EntitySchema`] per [`EntityKind`] describes the external-id
//! column, the writable fields with their types, and every dependency on
//! another entity together with its resolution policy. The reconciliation
//! engine and both storage backends are driven entirely by these tables.

use ledgersync_core::EntityKind;

use crate::state::{
    BankTransactionState, DetailItemState, DocumentReviewStatus, LedgerDocumentState, ProjectStatus,
    PurchaseOrderState, VendorStatus,
};

/// Declared type of a writable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Amount,
    Timestamp,
    /// Text restricted to a closed vocabulary.
    State(&'static [&'static str]),
}

/// Storage-level column type (states are stored as text, references as keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Amount,
    Timestamp,
    Reference,
}

impl FieldType {
    pub const fn column_type(self) -> ColumnType {
        match self {
            FieldType::Text | FieldType::State(_) => ColumnType::Text,
            FieldType::Integer => ColumnType::Integer,
            FieldType::Amount => ColumnType::Amount,
            FieldType::Timestamp => ColumnType::Timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Payload key and column name.
    pub name: &'static str,
    pub ty: FieldType,
    /// Must be present when the row is first created.
    pub required: bool,
}

/// How an unresolvable reference is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyPolicy {
    /// The upsert fails.
    Hard,
    /// A configured default surrogate id is substituted.
    Soft,
    /// The column is left untouched.
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencySpec {
    /// Key under `references` in the payload.
    pub name: &'static str,
    /// Foreign-key column holding the resolved surrogate id.
    pub column: &'static str,
    pub target: EntityKind,
    pub policy: DependencyPolicy,
}

#[derive(Debug)]
pub struct EntitySchema {
    pub kind: EntityKind,
    pub external_column: &'static str,
    pub fields: &'static [FieldSpec],
    pub dependencies: &'static [DependencySpec],
}

impl EntitySchema {
    pub fn table(&self) -> &'static str {
        self.kind.table_name()
    }

    pub fn field(&'static self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn dependency(&'static self, name: &str) -> Option<&'static DependencySpec> {
        self.dependencies.iter().find(|d| d.name == name)
    }

    /// Every writable column with its storage type, fields first.
    pub fn columns(&'static self) -> impl Iterator<Item = (&'static str, ColumnType)> {
        self.fields
            .iter()
            .map(|f| (f.name, f.ty.column_type()))
            .chain(self.dependencies.iter().map(|d| (d.column, ColumnType::Reference)))
    }

    pub fn column_type(&'static self, column: &str) -> Option<ColumnType> {
        self.columns().find(|(name, _)| *name == column).map(|(_, ty)| ty)
    }

    pub fn required_fields(&'static self) -> impl Iterator<Item = &'static str> {
        self.fields.iter().filter(|f| f.required).map(|f| f.name)
    }
}

const fn field(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: false,
    }
}

const fn required(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        required: true,
    }
}

const fn depends(
    name: &'static str,
    column: &'static str,
    target: EntityKind,
    policy: DependencyPolicy,
) -> DependencySpec {
    DependencySpec {
        name,
        column,
        target,
        policy,
    }
}

use DependencyPolicy::{Hard, Optional, Soft};
use FieldType::{Amount, Integer, State, Text, Timestamp};

static PROJECT: EntitySchema = EntitySchema {
    kind: EntityKind::Project,
    external_column: "project_number",
    fields: &[
        required("name", Text),
        field("status", State(ProjectStatus::NAMES)),
        field("total_spent", Amount),
    ],
    dependencies: &[],
};

static CONTACT: EntitySchema = EntitySchema {
    kind: EntityKind::Contact,
    external_column: "pulse_id",
    fields: &[
        required("name", Text),
        field("vendor_type", Text),
        field("payment_details", Text),
        field("email", Text),
        field("phone", Text),
        field("tax_number", Text),
        field("tax_type", Text),
        field("tax_form_link", Text),
        field("address_line_1", Text),
        field("address_line_2", Text),
        field("city", Text),
        field("zip", Text),
        field("region", Text),
        field("country", Text),
        field("vendor_status", State(VendorStatus::NAMES)),
    ],
    dependencies: &[],
};

static PURCHASE_ORDER: EntitySchema = EntitySchema {
    kind: EntityKind::PurchaseOrder,
    external_column: "pulse_id",
    fields: &[
        field("po_number", Integer),
        field("description", Text),
        field("po_type", Text),
        field("state", State(PurchaseOrderState::NAMES)),
        field("amount_total", Amount),
        field("producer", Text),
        field("folder_link", Text),
    ],
    dependencies: &[
        depends("project", "project_id", EntityKind::Project, Optional),
        depends("contact", "contact_id", EntityKind::Contact, Optional),
    ],
};

static DETAIL_ITEM: EntitySchema = EntitySchema {
    kind: EntityKind::DetailItem,
    external_column: "pulse_id",
    fields: &[
        field("state", State(DetailItemState::NAMES)),
        field("detail_number", Integer),
        field("line_id", Integer),
        field("vendor", Text),
        field("description", Text),
        field("transaction_date", Timestamp),
        field("due_date", Timestamp),
        field("rate", Amount),
        field("quantity", Amount),
        field("ot", Amount),
        field("fringes", Amount),
        field("payment_type", Text),
    ],
    dependencies: &[
        depends("parent", "po_id", EntityKind::PurchaseOrder, Hard),
        depends("account_code", "aicp_code_id", EntityKind::AccountCode, Soft),
    ],
};

static ACCOUNT_CODE: EntitySchema = EntitySchema {
    kind: EntityKind::AccountCode,
    external_column: "aicp_code",
    fields: &[field("aicp_description", Text)],
    dependencies: &[depends("tax_account", "tax_id", EntityKind::TaxAccount, Optional)],
};

static TAX_ACCOUNT: EntitySchema = EntitySchema {
    kind: EntityKind::TaxAccount,
    external_column: "tax_code",
    fields: &[field("description", Text)],
    dependencies: &[],
};

static BILL: EntitySchema = EntitySchema {
    kind: EntityKind::Bill,
    external_column: "xero_reference_number",
    fields: &[
        field("state", State(LedgerDocumentState::NAMES)),
        field("xero_link", Text),
    ],
    dependencies: &[],
};

static BILL_LINE_ITEM: EntitySchema = EntitySchema {
    kind: EntityKind::BillLineItem,
    external_column: "xero_id",
    fields: &[
        field("description", Text),
        field("quantity", Amount),
        field("unit_amount", Amount),
        field("line_amount", Amount),
        field("account_code", Integer),
    ],
    dependencies: &[
        depends("bill", "xero_bill_id", EntityKind::Bill, Hard),
        depends("detail_item", "detail_item_id", EntityKind::DetailItem, Optional),
    ],
};

static SPEND_MONEY: EntitySchema = EntitySchema {
    kind: EntityKind::SpendMoney,
    external_column: "xero_spend_money_reference_number",
    fields: &[
        field("state", State(LedgerDocumentState::NAMES)),
        field("xero_link", Text),
    ],
    dependencies: &[],
};

static BANK_TRANSACTION: EntitySchema = EntitySchema {
    kind: EntityKind::BankTransaction,
    external_column: "mercury_transaction_id",
    fields: &[field("state", State(BankTransactionState::NAMES))],
    dependencies: &[
        depends("bill", "xero_bill_id", EntityKind::Bill, Optional),
        depends("spend_money", "xero_spend_money_id", EntityKind::SpendMoney, Optional),
    ],
};

/// Vendor invoice keyed by `project-po-invoice` numbers.
static INVOICE: EntitySchema = EntitySchema {
    kind: EntityKind::Invoice,
    external_column: "invoice_ref",
    fields: &[
        required("project_number", Integer),
        required("po_number", Integer),
        required("invoice_number", Integer),
        field("term", Integer),
        field("total", Amount),
        field("transaction_date", Timestamp),
        field("status", State(DocumentReviewStatus::NAMES)),
        field("file_link", Text),
    ],
    dependencies: &[depends(
        "purchase_order",
        "purchase_order_id",
        EntityKind::PurchaseOrder,
        Optional,
    )],
};

static RECEIPT: EntitySchema = EntitySchema {
    kind: EntityKind::Receipt,
    external_column: "file_link",
    fields: &[
        required("project_number", Integer),
        field("po_number", Integer),
        field("detail_number", Integer),
        field("line_number", Integer),
        field("receipt_description", Text),
        field("total", Amount),
        field("status", State(DocumentReviewStatus::NAMES)),
        field("purchase_date", Timestamp),
        field("dropbox_path", Text),
    ],
    dependencies: &[depends("spend_money", "spend_money_id", EntityKind::SpendMoney, Optional)],
};

/// Schema for `kind`.
pub fn schema(kind: EntityKind) -> &'static EntitySchema {
    match kind {
        EntityKind::Project => &PROJECT,
        EntityKind::Contact => &CONTACT,
        EntityKind::PurchaseOrder => &PURCHASE_ORDER,
        EntityKind::DetailItem => &DETAIL_ITEM,
        EntityKind::AccountCode => &ACCOUNT_CODE,
        EntityKind::TaxAccount => &TAX_ACCOUNT,
        EntityKind::Bill => &BILL,
        EntityKind::BillLineItem => &BILL_LINE_ITEM,
        EntityKind::SpendMoney => &SPEND_MONEY,
        EntityKind::BankTransaction => &BANK_TRANSACTION,
        EntityKind::Invoice => &INVOICE,
        EntityKind::Receipt => &RECEIPT,
    }
}

/// Length of the longest dependency chain below `kind` (0 for leaves).
///
/// Applying payloads in ascending depth lands targets before dependents.
pub fn dependency_depth(kind: EntityKind) -> usize {
    schema(kind)
        .dependencies
        .iter()
        .map(|d| dependency_depth(d.target) + 1)
        .max()
        .unwrap_or(0)
}

/// Every soft dependency in the catalogue (each needs a configured default).
pub fn soft_dependencies() -> impl Iterator<Item = (EntityKind, &'static DependencySpec)> {
    EntityKind::ALL.into_iter().flat_map(|kind| {
        schema(kind)
            .dependencies
            .iter()
            .filter(|d| d.policy == DependencyPolicy::Soft)
            .map(move |d| (kind, d))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_kind_has_a_matching_schema() {
        for kind in EntityKind::ALL {
            assert_eq!(schema(kind).kind, kind);
        }
    }

    #[test]
    fn column_names_are_unique_per_table() {
        for kind in EntityKind::ALL {
            let s = schema(kind);
            let mut seen = HashSet::new();
            assert!(seen.insert(s.external_column));
            for (column, _) in s.columns() {
                assert!(seen.insert(column), "{kind}: duplicate column {column}");
            }
        }
    }

    #[test]
    fn dependencies_are_ordered_parents_first() {
        assert_eq!(dependency_depth(EntityKind::Contact), 0);
        assert!(
            dependency_depth(EntityKind::PurchaseOrder) < dependency_depth(EntityKind::DetailItem)
        );
        assert!(
            dependency_depth(EntityKind::DetailItem) < dependency_depth(EntityKind::BillLineItem)
        );
    }

    #[test]
    fn invoices_and_receipts_only_carry_optional_links() {
        for kind in [EntityKind::Invoice, EntityKind::Receipt] {
            let s = schema(kind);
            assert!(s.dependencies.iter().all(|d| d.policy == DependencyPolicy::Optional));
            assert!(s.required_fields().any(|f| f == "project_number"));
        }
        assert_eq!(schema(EntityKind::Receipt).external_column, "file_link");
    }

    #[test]
    fn account_code_is_the_only_soft_dependency() {
        let soft: Vec<_> = soft_dependencies().collect();
        assert_eq!(soft.len(), 1);
        assert_eq!(soft[0].0, EntityKind::DetailItem);
        assert_eq!(soft[0].1.target, EntityKind::AccountCode);
    }
}
