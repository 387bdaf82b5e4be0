//! Postgres-backed collaborator ports.
//!
//! - `PostgresOutbox` records outbound changes in `outbound_change`; the
//!   per-system delivery clients drain that table.
//! - `PostgresPayloadSource` reads staged payloads from `inbound_payload`.
//!
//! | Table | Key | Idempotency |
//! |-------|-----|-------------|
//! | `outbound_change` | `(entity_table, record_id, audit_id)` | `ON CONFLICT DO NOTHING` |
//! | `inbound_payload` | `id` | `completed_at IS NULL` filter |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use ledgersync_core::{AuditId, AuditTable, EntityKind};
use ledgersync_ledger::{EntityRow, Payload};

use super::ports::{
    CollaboratorError, InboundPayload, IngestAction, PayloadSource, Propagator, StagedPayload,
    UndecodablePayload,
};

fn unavailable(operation: &str, err: sqlx::Error) -> CollaboratorError {
    CollaboratorError::Unavailable(format!("{operation}: {err}"))
}

#[derive(Debug, Clone)]
pub struct PostgresOutbox {
    pool: Arc<PgPool>,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn record(
        &self,
        kind: EntityKind,
        record_id: i64,
        audit_id: AuditId,
        action: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(), CollaboratorError> {
        sqlx::query(
            r#"
            INSERT INTO outbound_change (entity_table, record_id, audit_id, action, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_table, record_id, audit_id) DO NOTHING
            "#,
        )
        .bind(kind.table_name())
        .bind(record_id)
        .bind(audit_id.get())
        .bind(action)
        .bind(payload.map(Json))
        .execute(&*self.pool)
        .await
        .map_err(|e| unavailable("outbound_change insert", e))?;
        Ok(())
    }
}

#[async_trait]
impl Propagator for PostgresOutbox {
    #[instrument(skip(self, row), fields(entity = %kind, record_id = row.id.get(), audit_id = audit_id.get()), err)]
    async fn propagate(
        &self,
        kind: EntityKind,
        row: &EntityRow,
        audit_id: AuditId,
    ) -> Result<Option<Payload>, CollaboratorError> {
        let snapshot = serde_json::to_value(row)
            .map_err(|e| CollaboratorError::Rejected(format!("row snapshot: {e}")))?;
        self.record(kind, row.id.get(), audit_id, "upsert", Some(snapshot))
            .await?;
        // Delivery is asynchronous; nothing to write back yet.
        Ok(None)
    }

    #[instrument(skip(self), fields(entity = %kind, audit_id = audit_id.get()), err)]
    async fn retract(
        &self,
        kind: EntityKind,
        record_id: i64,
        audit_id: AuditId,
    ) -> Result<(), CollaboratorError> {
        self.record(kind, record_id, audit_id, "delete", None).await
    }
}

#[derive(Debug, Clone)]
pub struct PostgresPayloadSource {
    pool: Arc<PgPool>,
}

impl PostgresPayloadSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

/// Decode one staged row. Only a missing `id` is a load failure; anything
/// wrong with the row's content makes just that row undecodable.
fn decode_inbound(row: &PgRow) -> Result<StagedPayload, CollaboratorError> {
    let row_id: i64 = row
        .try_get("id")
        .map_err(|e| unavailable("inbound_payload decode", e))?;
    Ok(decode_content(row).map_err(|reason| UndecodablePayload { row_id, reason }))
}

fn decode_content(row: &PgRow) -> Result<InboundPayload, String> {
    let kind: String = row.try_get("entity_kind").map_err(|e| e.to_string())?;
    let action: String = row.try_get("action").map_err(|e| e.to_string())?;
    let Json(raw): Json<serde_json::Value> = row.try_get("payload").map_err(|e| e.to_string())?;

    Ok(InboundPayload {
        kind: kind.parse::<EntityKind>().map_err(|e| e.to_string())?,
        action: action.parse::<IngestAction>().map_err(|e| e.to_string())?,
        payload: serde_json::from_value::<Payload>(raw).map_err(|e| e.to_string())?,
    })
}

#[async_trait]
impl PayloadSource for PostgresPayloadSource {
    #[instrument(skip(self), fields(table = %table), err)]
    async fn load(
        &self,
        table: AuditTable,
        record_id: i64,
    ) -> Result<Vec<StagedPayload>, CollaboratorError> {
        // A staged webhook row is its own audit subject; batch sources
        // (parsed log files) stage many rows under one source id.
        let rows = match table {
            AuditTable::InboundPayload => {
                sqlx::query(
                    r#"
                    SELECT id, entity_kind, action, payload
                    FROM inbound_payload
                    WHERE id = $1 AND completed_at IS NULL
                    ORDER BY id
                    "#,
                )
                .bind(record_id)
                .fetch_all(&*self.pool)
                .await
            }
            _ => {
                sqlx::query(
                    r#"
                    SELECT id, entity_kind, action, payload
                    FROM inbound_payload
                    WHERE source_table = $1 AND source_id = $2 AND completed_at IS NULL
                    ORDER BY id
                    "#,
                )
                .bind(table.name())
                .bind(record_id)
                .fetch_all(&*self.pool)
                .await
            }
        }
        .map_err(|e| unavailable("inbound_payload load", e))?;

        rows.iter().map(decode_inbound).collect()
    }

    #[instrument(skip(self), fields(table = %table), err)]
    async fn mark_completed(
        &self,
        table: AuditTable,
        record_id: i64,
    ) -> Result<(), CollaboratorError> {
        let query = match table {
            AuditTable::InboundPayload => sqlx::query(
                r#"
                UPDATE inbound_payload SET completed_at = NOW()
                WHERE id = $1 AND completed_at IS NULL
                "#,
            )
            .bind(record_id),
            _ => sqlx::query(
                r#"
                UPDATE inbound_payload SET completed_at = NOW()
                WHERE source_table = $1 AND source_id = $2 AND completed_at IS NULL
                "#,
            )
            .bind(table.name())
            .bind(record_id),
        };
        query
            .execute(&*self.pool)
            .await
            .map_err(|e| unavailable("inbound_payload complete", e))?;
        Ok(())
    }
}
