//! Stored representation of a reconciled entity.

use serde::Serialize;

use ledgersync_core::{EntityKind, ExternalId, SurrogateId};

use crate::value::{FieldChanges, FieldValue};

/// One ledger row: identity, non-null columns and the last applied source
/// version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityRow {
    pub kind: EntityKind,
    pub id: SurrogateId,
    pub external_id: ExternalId,
    pub fields: FieldChanges,
    pub source_version: Option<i64>,
}

impl EntityRow {
    pub fn new(kind: EntityKind, id: SurrogateId, external_id: ExternalId) -> Self {
        Self {
            kind,
            id,
            external_id,
            fields: FieldChanges::new(),
            source_version: None,
        }
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }

    /// Overwrite every column named in `changes`; untouched columns keep
    /// their value. Returns whether anything actually changed.
    pub fn apply(&mut self, changes: &FieldChanges) -> bool {
        let mut changed = false;
        for (column, value) in changes {
            if self.fields.get(column) != Some(value) {
                self.fields.insert(*column, value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Whether a payload at `incoming` may be applied over this row.
    ///
    /// Unversioned payloads always apply (last write wins); a versioned
    /// payload must not be older than what the row already reflects.
    pub fn accepts_version(&self, incoming: Option<i64>) -> bool {
        match (self.source_version, incoming) {
            (Some(stored), Some(incoming)) => incoming >= stored,
            _ => true,
        }
    }

    /// Version to store after applying a payload at `incoming`.
    pub fn next_version(&self, incoming: Option<i64>) -> Option<i64> {
        match (self.source_version, incoming) {
            (Some(stored), Some(incoming)) => Some(stored.max(incoming)),
            (stored, incoming) => incoming.or(stored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use proptest::prelude::*;

    fn row() -> EntityRow {
        EntityRow::new(
            EntityKind::PurchaseOrder,
            SurrogateId::new(1),
            ExternalId::parse("42").unwrap(),
        )
    }

    #[test]
    fn stale_versions_are_refused() {
        let mut r = row();
        r.source_version = Some(5);
        assert!(!r.accepts_version(Some(4)));
        assert!(r.accepts_version(Some(5)));
        assert!(r.accepts_version(None));
        assert_eq!(r.next_version(None), Some(5));
        assert_eq!(r.next_version(Some(9)), Some(9));
    }

    const COLUMNS: [&str; 4] = ["description", "po_type", "producer", "folder_link"];

    fn changes_strategy() -> impl Strategy<Value = FieldChanges> {
        prop::collection::btree_map(
            prop::sample::select(COLUMNS.to_vec()),
            prop_oneof![
                "[a-z]{0,8}".prop_map(FieldValue::Text),
                any::<i64>().prop_map(|v| FieldValue::Amount(Amount::from_minor_units(v))),
            ],
            0..COLUMNS.len(),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: applying the same changes twice is the same as applying them once.
        #[test]
        fn apply_is_idempotent(base in changes_strategy(), update in changes_strategy()) {
            let mut once = row();
            once.apply(&base);
            once.apply(&update);

            let mut twice = once.clone();
            let changed = twice.apply(&update);

            prop_assert!(!changed);
            prop_assert_eq!(once, twice);
        }

        /// Property: columns absent from an update keep their previous value.
        #[test]
        fn absent_columns_are_untouched(base in changes_strategy(), update in changes_strategy()) {
            let mut r = row();
            r.apply(&base);
            let before = r.clone();
            r.apply(&update);

            for column in COLUMNS {
                if !update.contains_key(column) {
                    prop_assert_eq!(r.get(column), before.get(column));
                }
            }
        }
    }
}
