//! Typed payloads for the primary reconciled entities.
//!
//! These are conveniences over [`Payload`]: every `Option` left as `None`
//! stays out of the payload and therefore means "no change".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledgersync_core::{EntityKind, ExternalId};

use crate::amount::Amount;
use crate::payload::Payload;
use crate::state::{
    BankTransactionState, DetailItemState, LedgerDocumentState, PurchaseOrderState, VendorStatus,
};

/// Payload types that know which entity they describe.
pub trait EntityPayload {
    const KIND: EntityKind;

    fn into_payload(self) -> Payload;
}

fn amount(value: Option<Amount>) -> Option<String> {
    value.map(|a| a.to_string())
}

fn state<S: core::fmt::Display>(value: Option<S>) -> Option<String> {
    value.map(|s| s.to_string())
}

fn timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderPayload {
    pub external_id: ExternalId,
    pub po_number: Option<i64>,
    pub description: Option<String>,
    pub po_type: Option<String>,
    pub state: Option<PurchaseOrderState>,
    pub amount_total: Option<Amount>,
    pub producer: Option<String>,
    pub folder_link: Option<String>,
    pub project: Option<ExternalId>,
    pub contact: Option<ExternalId>,
    pub source_version: Option<i64>,
}

impl PurchaseOrderPayload {
    pub fn new(external_id: ExternalId) -> Self {
        Self {
            external_id,
            po_number: None,
            description: None,
            po_type: None,
            state: None,
            amount_total: None,
            producer: None,
            folder_link: None,
            project: None,
            contact: None,
            source_version: None,
        }
    }
}

impl EntityPayload for PurchaseOrderPayload {
    const KIND: EntityKind = EntityKind::PurchaseOrder;

    fn into_payload(self) -> Payload {
        base(self.external_id, self.source_version)
            .field_opt("po_number", self.po_number)
            .field_opt("description", self.description)
            .field_opt("po_type", self.po_type)
            .field_opt("state", state(self.state))
            .field_opt("amount_total", amount(self.amount_total))
            .field_opt("producer", self.producer)
            .field_opt("folder_link", self.folder_link)
            .reference_opt("project", self.project)
            .reference_opt("contact", self.contact)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailItemPayload {
    pub external_id: ExternalId,
    /// External id of the parent purchase order (hard dependency).
    pub parent: Option<ExternalId>,
    /// Ledger account code (soft dependency, defaulted when unknown).
    pub account_code: Option<ExternalId>,
    pub state: Option<DetailItemState>,
    pub detail_number: Option<i64>,
    pub line_id: Option<i64>,
    pub vendor: Option<String>,
    pub description: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub rate: Option<Amount>,
    pub quantity: Option<Amount>,
    pub ot: Option<Amount>,
    pub fringes: Option<Amount>,
    pub payment_type: Option<String>,
    pub source_version: Option<i64>,
}

impl DetailItemPayload {
    pub fn new(external_id: ExternalId, parent: ExternalId) -> Self {
        Self {
            external_id,
            parent: Some(parent),
            account_code: None,
            state: None,
            detail_number: None,
            line_id: None,
            vendor: None,
            description: None,
            transaction_date: None,
            due_date: None,
            rate: None,
            quantity: None,
            ot: None,
            fringes: None,
            payment_type: None,
            source_version: None,
        }
    }
}

impl EntityPayload for DetailItemPayload {
    const KIND: EntityKind = EntityKind::DetailItem;

    fn into_payload(self) -> Payload {
        base(self.external_id, self.source_version)
            .field_opt("state", state(self.state))
            .field_opt("detail_number", self.detail_number)
            .field_opt("line_id", self.line_id)
            .field_opt("vendor", self.vendor)
            .field_opt("description", self.description)
            .field_opt("transaction_date", timestamp(self.transaction_date))
            .field_opt("due_date", timestamp(self.due_date))
            .field_opt("rate", amount(self.rate))
            .field_opt("quantity", amount(self.quantity))
            .field_opt("ot", amount(self.ot))
            .field_opt("fringes", amount(self.fringes))
            .field_opt("payment_type", self.payment_type)
            .reference_opt("parent", self.parent)
            .reference_opt("account_code", self.account_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPayload {
    pub external_id: ExternalId,
    pub name: Option<String>,
    pub vendor_type: Option<String>,
    pub payment_details: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tax_number: Option<String>,
    pub tax_type: Option<String>,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub vendor_status: Option<VendorStatus>,
    pub source_version: Option<i64>,
}

impl ContactPayload {
    pub fn new(external_id: ExternalId, name: impl Into<String>) -> Self {
        Self {
            external_id,
            name: Some(name.into()),
            vendor_type: None,
            payment_details: None,
            email: None,
            phone: None,
            tax_number: None,
            tax_type: None,
            address_line_1: None,
            address_line_2: None,
            city: None,
            zip: None,
            region: None,
            country: None,
            vendor_status: None,
            source_version: None,
        }
    }
}

impl EntityPayload for ContactPayload {
    const KIND: EntityKind = EntityKind::Contact;

    fn into_payload(self) -> Payload {
        base(self.external_id, self.source_version)
            .field_opt("name", self.name)
            .field_opt("vendor_type", self.vendor_type)
            .field_opt("payment_details", self.payment_details)
            .field_opt("email", self.email)
            .field_opt("phone", self.phone)
            .field_opt("tax_number", self.tax_number)
            .field_opt("tax_type", self.tax_type)
            .field_opt("address_line_1", self.address_line_1)
            .field_opt("address_line_2", self.address_line_2)
            .field_opt("city", self.city)
            .field_opt("zip", self.zip)
            .field_opt("region", self.region)
            .field_opt("country", self.country)
            .field_opt("vendor_status", state(self.vendor_status))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillPayload {
    /// Ledger reference number.
    pub external_id: ExternalId,
    pub state: Option<LedgerDocumentState>,
    pub xero_link: Option<String>,
    pub source_version: Option<i64>,
}

impl BillPayload {
    pub fn new(external_id: ExternalId) -> Self {
        Self {
            external_id,
            state: None,
            xero_link: None,
            source_version: None,
        }
    }
}

impl EntityPayload for BillPayload {
    const KIND: EntityKind = EntityKind::Bill;

    fn into_payload(self) -> Payload {
        base(self.external_id, self.source_version)
            .field_opt("state", state(self.state))
            .field_opt("xero_link", self.xero_link)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankTransactionPayload {
    /// Banking provider transaction id.
    pub external_id: ExternalId,
    pub state: Option<BankTransactionState>,
    pub bill: Option<ExternalId>,
    pub spend_money: Option<ExternalId>,
    pub source_version: Option<i64>,
}

impl BankTransactionPayload {
    pub fn new(external_id: ExternalId) -> Self {
        Self {
            external_id,
            state: None,
            bill: None,
            spend_money: None,
            source_version: None,
        }
    }
}

impl EntityPayload for BankTransactionPayload {
    const KIND: EntityKind = EntityKind::BankTransaction;

    fn into_payload(self) -> Payload {
        base(self.external_id, self.source_version)
            .field_opt("state", state(self.state))
            .reference_opt("bill", self.bill)
            .reference_opt("spend_money", self.spend_money)
    }
}

fn base(external_id: ExternalId, source_version: Option<i64>) -> Payload {
    let mut payload = Payload::new(external_id);
    payload.source_version = source_version;
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::schema;

    #[test]
    fn detail_item_payload_carries_both_references() {
        let payload = DetailItemPayload {
            account_code: Some(ExternalId::parse("9999").unwrap()),
            rate: Some(Amount::from_minor_units(1250)),
            ..DetailItemPayload::new(
                ExternalId::parse("777").unwrap(),
                ExternalId::parse("123").unwrap(),
            )
        }
        .into_payload();

        let normalized = schema(EntityKind::DetailItem).normalize(&payload).unwrap();
        assert_eq!(normalized.references.len(), 2);
        assert!(normalized.changes.contains_key("rate"));
        assert!(!normalized.changes.contains_key("description"));
    }

    #[test]
    fn typed_states_survive_normalization() {
        let payload = PurchaseOrderPayload {
            state: Some(PurchaseOrderState::CardOrPettyCash),
            ..PurchaseOrderPayload::new(ExternalId::from(42))
        }
        .into_payload();
        let normalized = schema(EntityKind::PurchaseOrder).normalize(&payload).unwrap();
        assert_eq!(
            normalized.changes.get("state").and_then(|v| v.as_text()),
            Some("CC / PC")
        );
    }
}
