//! Postgres-backed ledger store.
//!
//! SQL is assembled from the static entity schemas: table and column names
//! never come from input, every value is bound. Column encodings:
//!
//! | Column type | SQL type |
//! |-------------|----------|
//! | text / state | `TEXT` |
//! | integer | `BIGINT` |
//! | amount | `BIGINT` (minor units) |
//! | timestamp | `TIMESTAMPTZ` |
//! | reference | `BIGINT` surrogate id |
//!
//! Every entity table also carries `id BIGSERIAL`, the external-id column
//! (`TEXT`, unique) and `source_version BIGINT NULL`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::instrument;

use ledgersync_core::{EntityKind, ExternalId, SurrogateId};
use ledgersync_ledger::{Amount, ColumnType, EntityRow, FieldChanges, FieldValue, schema};

use super::{LedgerStore, LedgerTx, RowLock, StoreError, map_sqlx_error};

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn select_sql(kind: EntityKind, key_column: &str) -> String {
    let schema = schema(kind);
    let mut columns = vec!["id", schema.external_column, "source_version"];
    columns.extend(schema.columns().map(|(name, _)| name));
    format!(
        "SELECT {} FROM {} WHERE {} = $1",
        columns.join(", "),
        schema.table(),
        key_column
    )
}

/// Lookup by external id under `lock`. The upserted row is never re-keyed,
/// so `NO KEY UPDATE` is enough and leaves `KEY SHARE` readers unblocked.
fn locked_select_sql(kind: EntityKind, lock: RowLock) -> String {
    let clause = match lock {
        RowLock::Exclusive => "FOR NO KEY UPDATE",
        RowLock::KeyShare => "FOR KEY SHARE",
    };
    format!("{} {clause}", select_sql(kind, schema(kind).external_column))
}

fn decode_row(kind: EntityKind, row: &PgRow) -> Result<EntityRow, sqlx::Error> {
    let schema = schema(kind);
    let id: i64 = row.try_get("id")?;
    let external: String = row.try_get(schema.external_column)?;
    let external_id = ExternalId::parse(&external).map_err(|e| sqlx::Error::ColumnDecode {
        index: schema.external_column.to_string(),
        source: Box::new(e),
    })?;

    let mut entity = EntityRow::new(kind, SurrogateId::new(id), external_id);
    entity.source_version = row.try_get("source_version")?;

    for (column, ty) in schema.columns() {
        let value = match ty {
            ColumnType::Text => row.try_get::<Option<String>, _>(column)?.map(FieldValue::Text),
            ColumnType::Integer => row.try_get::<Option<i64>, _>(column)?.map(FieldValue::Integer),
            ColumnType::Amount => row
                .try_get::<Option<i64>, _>(column)?
                .map(|v| FieldValue::Amount(Amount::from_minor_units(v))),
            ColumnType::Timestamp => row
                .try_get::<Option<DateTime<Utc>>, _>(column)?
                .map(FieldValue::Timestamp),
            ColumnType::Reference => row
                .try_get::<Option<i64>, _>(column)?
                .map(|v| FieldValue::Reference(SurrogateId::new(v))),
        };
        if let Some(value) = value {
            entity.fields.insert(column, value);
        }
    }
    Ok(entity)
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &FieldValue) {
    match value {
        FieldValue::Text(s) => qb.push_bind(s.clone()),
        FieldValue::Integer(i) => qb.push_bind(*i),
        FieldValue::Amount(a) => qb.push_bind(a.minor_units()),
        FieldValue::Timestamp(t) => qb.push_bind(*t),
        FieldValue::Reference(id) => qb.push_bind(id.get()),
    };
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresLedgerTx { tx: Some(tx) }))
    }

    #[instrument(skip(self), fields(table = kind.table_name(), id = %id), err)]
    async fn get(&self, kind: EntityKind, id: SurrogateId) -> Result<Option<EntityRow>, StoreError> {
        let row = sqlx::query(&select_sql(kind, "id"))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| decode_row(kind, &r))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_row", e))
    }

    #[instrument(skip(self), fields(table = kind.table_name(), external_id = %external_id), err)]
    async fn find(
        &self,
        kind: EntityKind,
        external_id: &ExternalId,
    ) -> Result<Option<EntityRow>, StoreError> {
        let row = sqlx::query(&select_sql(kind, schema(kind).external_column))
            .bind(external_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;
        row.map(|r| decode_row(kind, &r))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_row", e))
    }
}

struct PostgresLedgerTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresLedgerTx {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))
    }
}

#[async_trait]
impl LedgerTx for PostgresLedgerTx {
    async fn find_by_external(
        &mut self,
        kind: EntityKind,
        external_id: &ExternalId,
        lock: RowLock,
    ) -> Result<Option<EntityRow>, StoreError> {
        let tx = self.open()?;
        let row = sqlx::query(&locked_select_sql(kind, lock))
            .bind(external_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("find_by_external", e))?;
        row.map(|r| decode_row(kind, &r))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_row", e))
    }

    #[instrument(skip(self, changes), fields(table = kind.table_name(), external_id = %external_id), err)]
    async fn insert(
        &mut self,
        kind: EntityKind,
        external_id: &ExternalId,
        changes: &FieldChanges,
        source_version: Option<i64>,
    ) -> Result<SurrogateId, StoreError> {
        let schema = schema(kind);
        let tx = self.open()?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} ({}, source_version",
            schema.table(),
            schema.external_column
        ));
        for column in changes.keys() {
            qb.push(", ").push(*column);
        }
        qb.push(") VALUES (");
        qb.push_bind(external_id.as_str().to_string());
        qb.push(", ");
        qb.push_bind(source_version);
        for value in changes.values() {
            qb.push(", ");
            push_value(&mut qb, value);
        }
        qb.push(") RETURNING id");

        let row = qb
            .build()
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("insert", e))?;
        Ok(SurrogateId::new(id))
    }

    #[instrument(skip(self, changes), fields(table = kind.table_name(), id = %id), err)]
    async fn update(
        &mut self,
        kind: EntityKind,
        id: SurrogateId,
        changes: &FieldChanges,
        source_version: Option<i64>,
    ) -> Result<(), StoreError> {
        let schema = schema(kind);
        let tx = self.open()?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET ", schema.table()));
        qb.push("source_version = ");
        qb.push_bind(source_version);
        qb.push(", updated_at = NOW()");
        for (column, value) in changes {
            qb.push(", ").push(*column).push(" = ");
            push_value(&mut qb, value);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id.get());

        let result = qb
            .build()
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("{} {}", schema.table(), id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(table = kind.table_name(), external_id = %external_id), err)]
    async fn delete_by_external(
        &mut self,
        kind: EntityKind,
        external_id: &ExternalId,
    ) -> Result<Option<SurrogateId>, StoreError> {
        let schema = schema(kind);
        let tx = self.open()?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1 RETURNING id",
            schema.table(),
            schema.external_column
        );
        let id: Option<i64> = sqlx::query_scalar(&sql)
            .bind(external_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_by_external", e))?;
        Ok(id.map(SurrogateId::new))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_lists_identity_then_schema_columns() {
        let sql = select_sql(EntityKind::AccountCode, "aicp_code");
        assert_eq!(
            sql,
            "SELECT id, aicp_code, source_version, aicp_description, tax_id FROM aicp_code WHERE aicp_code = $1"
        );
    }

    #[test]
    fn only_the_upserted_row_is_locked_for_update() {
        let upserted = locked_select_sql(EntityKind::DetailItem, RowLock::Exclusive);
        assert!(upserted.ends_with("WHERE pulse_id = $1 FOR NO KEY UPDATE"));

        let target = locked_select_sql(EntityKind::PurchaseOrder, RowLock::KeyShare);
        assert!(target.ends_with("WHERE pulse_id = $1 FOR KEY SHARE"));
        assert!(!target.contains("UPDATE"));
    }
}
