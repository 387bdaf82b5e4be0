//! State vocabularies of the reconciled entities.
//!
//! States are owned by the external systems of record; the ledger only stores
//! whatever the latest payload says. Each enum therefore carries its wire
//! spelling and nothing else (no transition rules).

use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use ledgersync_core::DomainError;

macro_rules! state_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal { $($variant:ident => $wire:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Wire spellings, in declaration order.
            pub const NAMES: &'static [&'static str] = &[$($wire),+];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                $(
                    if s.eq_ignore_ascii_case($wire) {
                        return Ok($name::$variant);
                    }
                )+
                Err(DomainError::unknown($label, s))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

state_enum! {
    ProjectStatus, "project status" {
        Active => "Active",
        Closed => "Closed",
    }
}

state_enum! {
    /// Vendor onboarding status on the board.
    VendorStatus, "vendor status" {
        Pending => "PENDING",
        ToVerify => "TO VERIFY",
        Approved => "APPROVED",
        Issue => "ISSUE",
    }
}

state_enum! {
    PurchaseOrderState, "purchase order state" {
        Approved => "APPROVED",
        ToVerify => "TO VERIFY",
        Issue => "ISSUE",
        Pending => "PENDING",
        CardOrPettyCash => "CC / PC",
        Paid => "PAID",
    }
}

state_enum! {
    DetailItemState, "detail item state" {
        Pending => "PENDING",
        Overdue => "OVERDUE",
        Issue => "ISSUE",
        ReadyToPay => "RTP",
        Reconciled => "RECONCILED",
        Paid => "PAID",
        Approved => "APPROVED",
        Reviewed => "REVIEWED",
        Submitted => "SUBMITTED",
        PoMismatch => "PO MISMATCH",
    }
}

state_enum! {
    /// Document status in the accounting ledger (bills and spend-money).
    LedgerDocumentState, "ledger document state" {
        Draft => "Draft",
        Submitted => "Submitted",
        Authorised => "Authorised",
        Paid => "Paid",
        Voided => "Voided",
        Deleted => "Deleted",
    }
}

state_enum! {
    BankTransactionState, "bank transaction state" {
        Pending => "Pending",
        Sent => "Sent",
        Cancelled => "Cancelled",
        Failed => "Failed",
        Reconciled => "Reconciled",
    }
}

state_enum! {
    /// Review status of a vendor document (invoices and receipts).
    DocumentReviewStatus, "document review status" {
        Pending => "PENDING",
        Verified => "VERIFIED",
        Rejected => "REJECTED",
    }
}

/// Canonical spelling of `value` within `names`, case-insensitively.
pub fn canonical_state(names: &'static [&'static str], value: &str) -> Option<&'static str> {
    let value = value.trim();
    names.iter().copied().find(|n| n.eq_ignore_ascii_case(value))
}
