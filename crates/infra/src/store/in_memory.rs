//! In-memory ledger store for tests/dev.
//!
//! A transaction holds the store-wide lock for its whole lifetime and works
//! on a staged copy of the tables; commit swaps the copy in. Transactions are
//! therefore fully serialized.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use ledgersync_core::{EntityKind, ExternalId, SurrogateId};
use ledgersync_ledger::{EntityRow, FieldChanges};

use super::{LedgerStore, LedgerTx, RowLock, StoreError};

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<SurrogateId, EntityRow>,
    by_external: HashMap<ExternalId, SurrogateId>,
    last_id: i64,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    tables: HashMap<EntityKind, Table>,
}

impl Tables {
    fn table(&self, kind: EntityKind) -> Option<&Table> {
        self.tables.get(&kind)
    }

    fn table_mut(&mut self, kind: EntityKind) -> &mut Table {
        self.tables.entry(kind).or_default()
    }

    fn find(&self, kind: EntityKind, external_id: &ExternalId) -> Option<EntityRow> {
        let table = self.table(kind)?;
        let id = table.by_external.get(external_id)?;
        table.rows.get(id).cloned()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    inner: Arc<Mutex<Tables>>,
    race_next_insert: Arc<AtomicBool>,
    lookups: Arc<StdMutex<Vec<(EntityKind, RowLock)>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next insert fail with a unique violation, as if a concurrent
    /// writer had committed the same external id first.
    pub fn race_next_insert(&self) {
        self.race_next_insert.store(true, Ordering::SeqCst);
    }

    /// Every transactional lookup so far, with the lock it asked for.
    pub fn lookups(&self) -> Vec<(EntityKind, RowLock)> {
        self.lookups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Insert a row directly, bypassing reconciliation.
    pub async fn seed(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        fields: FieldChanges,
    ) -> SurrogateId {
        let mut tables = self.inner.lock().await;
        insert_row(tables.table_mut(kind), kind, external_id, &fields, None)
    }

    /// Every row of `kind`, in surrogate id order.
    pub async fn rows(&self, kind: EntityKind) -> Vec<EntityRow> {
        let tables = self.inner.lock().await;
        tables
            .table(kind)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self, kind: EntityKind) -> usize {
        let tables = self.inner.lock().await;
        tables.table(kind).map(|t| t.rows.len()).unwrap_or(0)
    }
}

fn insert_row(
    table: &mut Table,
    kind: EntityKind,
    external_id: ExternalId,
    changes: &FieldChanges,
    source_version: Option<i64>,
) -> SurrogateId {
    table.last_id += 1;
    let id = SurrogateId::new(table.last_id);
    let mut row = EntityRow::new(kind, id, external_id.clone());
    row.apply(changes);
    row.source_version = source_version;
    table.rows.insert(id, row);
    table.by_external.insert(external_id, id);
    id
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let guard = self.inner.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryLedgerTx {
            guard: Some(guard),
            staged,
            race_next_insert: self.race_next_insert.clone(),
            lookups: self.lookups.clone(),
        }))
    }

    async fn get(&self, kind: EntityKind, id: SurrogateId) -> Result<Option<EntityRow>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables.table(kind).and_then(|t| t.rows.get(&id).cloned()))
    }

    async fn find(
        &self,
        kind: EntityKind,
        external_id: &ExternalId,
    ) -> Result<Option<EntityRow>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables.find(kind, external_id))
    }
}

struct InMemoryLedgerTx {
    guard: Option<OwnedMutexGuard<Tables>>,
    staged: Tables,
    race_next_insert: Arc<AtomicBool>,
    lookups: Arc<StdMutex<Vec<(EntityKind, RowLock)>>>,
}

impl InMemoryLedgerTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.guard.is_some() {
            Ok(())
        } else {
            Err(StoreError::Backend("transaction already finished".into()))
        }
    }
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    async fn find_by_external(
        &mut self,
        kind: EntityKind,
        external_id: &ExternalId,
        lock: RowLock,
    ) -> Result<Option<EntityRow>, StoreError> {
        self.ensure_open()?;
        self.lookups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((kind, lock));
        Ok(self.staged.find(kind, external_id))
    }

    async fn insert(
        &mut self,
        kind: EntityKind,
        external_id: &ExternalId,
        changes: &FieldChanges,
        source_version: Option<i64>,
    ) -> Result<SurrogateId, StoreError> {
        self.ensure_open()?;
        let table = self.staged.table_mut(kind);
        if self.race_next_insert.swap(false, Ordering::SeqCst)
            || table.by_external.contains_key(external_id)
        {
            return Err(StoreError::Conflict(format!(
                "duplicate {} external id {}",
                kind.table_name(),
                external_id
            )));
        }
        Ok(insert_row(table, kind, external_id.clone(), changes, source_version))
    }

    async fn update(
        &mut self,
        kind: EntityKind,
        id: SurrogateId,
        changes: &FieldChanges,
        source_version: Option<i64>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let row = self
            .staged
            .table_mut(kind)
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", kind.table_name(), id)))?;
        row.apply(changes);
        row.source_version = source_version;
        Ok(())
    }

    async fn delete_by_external(
        &mut self,
        kind: EntityKind,
        external_id: &ExternalId,
    ) -> Result<Option<SurrogateId>, StoreError> {
        self.ensure_open()?;
        let table = self.staged.table_mut(kind);
        let Some(id) = table.by_external.remove(external_id) else {
            return Ok(None);
        };
        table.rows.remove(&id);
        Ok(Some(id))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))?;
        *guard = std::mem::take(&mut self.staged);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.guard.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_ledger::FieldValue;

    fn ext(value: &str) -> ExternalId {
        ExternalId::parse(value).unwrap()
    }

    fn description(text: &str) -> FieldChanges {
        let mut changes = FieldChanges::new();
        changes.insert("description", FieldValue::from(text));
        changes
    }

    #[tokio::test]
    async fn committed_writes_are_visible() {
        let store = InMemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx
            .insert(EntityKind::PurchaseOrder, &ext("42"), &description("A"), None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let row = store.get(EntityKind::PurchaseOrder, id).await.unwrap().unwrap();
        assert_eq!(row.get("description"), Some(&FieldValue::from("A")));
        assert!(store.find(EntityKind::PurchaseOrder, &ext("42")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_transactions_leave_no_trace() {
        let store = InMemoryLedgerStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(EntityKind::PurchaseOrder, &ext("42"), &description("A"), None)
                .await
                .unwrap();
        }
        assert_eq!(store.count(EntityKind::PurchaseOrder).await, 0);
    }

    #[tokio::test]
    async fn duplicate_external_ids_conflict() {
        let store = InMemoryLedgerStore::new();
        store
            .seed(EntityKind::Contact, ext("7"), FieldChanges::new())
            .await;

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert(EntityKind::Contact, &ext("7"), &FieldChanges::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn surrogate_ids_are_per_table() {
        let store = InMemoryLedgerStore::new();
        let a = store.seed(EntityKind::Contact, ext("1"), FieldChanges::new()).await;
        let b = store.seed(EntityKind::Project, ext("1"), FieldChanges::new()).await;
        assert_eq!(a, SurrogateId::new(1));
        assert_eq!(b, SurrogateId::new(1));
    }

    #[tokio::test]
    async fn finished_transactions_reject_further_use() {
        let store = InMemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.rollback().await.unwrap();
        assert!(tx.find_by_external(EntityKind::Bill, &ext("x"), RowLock::KeyShare)
                .await
                .is_err());
    }
}
