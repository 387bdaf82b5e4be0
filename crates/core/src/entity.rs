//! Closed set of reconciled entity types.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Every ledger table the engine reconciles.
///
/// Table names coming from the audit log or from staged payloads are mapped
/// onto this enum once, at the edge; past that point nothing is keyed by raw
/// strings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntityKind {
    Project,
    Contact,
    PurchaseOrder,
    DetailItem,
    AccountCode,
    TaxAccount,
    Bill,
    BillLineItem,
    SpendMoney,
    BankTransaction,
    Invoice,
    Receipt,
}

impl EntityKind {
    pub const ALL: [EntityKind; 12] = [
        EntityKind::Project,
        EntityKind::Contact,
        EntityKind::PurchaseOrder,
        EntityKind::DetailItem,
        EntityKind::AccountCode,
        EntityKind::TaxAccount,
        EntityKind::Bill,
        EntityKind::BillLineItem,
        EntityKind::SpendMoney,
        EntityKind::BankTransaction,
        EntityKind::Invoice,
        EntityKind::Receipt,
    ];

    /// Name of the backing table (also the name the audit log reports).
    pub const fn table_name(self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Contact => "contact",
            EntityKind::PurchaseOrder => "purchase_order",
            EntityKind::DetailItem => "detail_item",
            EntityKind::AccountCode => "aicp_code",
            EntityKind::TaxAccount => "tax_account",
            EntityKind::Bill => "xero_bill",
            EntityKind::BillLineItem => "bill_line_item",
            EntityKind::SpendMoney => "spend_money",
            EntityKind::BankTransaction => "bank_transaction",
            EntityKind::Invoice => "invoice",
            EntityKind::Receipt => "receipt",
        }
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.table_name().eq_ignore_ascii_case(name))
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_table_name(s).ok_or_else(|| DomainError::unknown("entity table", s))
    }
}

impl TryFrom<String> for EntityKind {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityKind> for String {
    fn from(value: EntityKind) -> Self {
        value.table_name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip_through_lookup() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_table_name(kind.table_name()), Some(kind));
        }
    }

    #[test]
    fn lookup_is_case_insensitive_and_rejects_unknown_tables() {
        assert_eq!(
            EntityKind::from_table_name("Purchase_Order"),
            Some(EntityKind::PurchaseOrder)
        );
        assert!("unknown_table".parse::<EntityKind>().is_err());
    }

    #[test]
    fn serde_uses_the_table_name() {
        let json = serde_json::to_string(&EntityKind::Bill).unwrap();
        assert_eq!(json, "\"xero_bill\"");

        let kind: EntityKind = serde_json::from_str("\"aicp_code\"").unwrap();
        assert_eq!(kind, EntityKind::AccountCode);
        assert!(serde_json::from_str::<EntityKind>("\"account_code\"").is_err());

        for kind in EntityKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(serde_json::from_str::<EntityKind>(&json).unwrap(), kind);
            assert_eq!(json.trim_matches('"').parse::<EntityKind>().unwrap(), kind);
        }
    }
}
