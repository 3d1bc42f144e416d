//! Database query functions for the append-only `audit_events` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AuditEvent, AuditEventKind};

/// Parameters for appending a new audit event row.
#[derive(Debug, Clone)]
pub struct NewAuditEvent<'a> {
    pub event_kind: AuditEventKind,
    pub resource_id: Uuid,
    pub user_hash: Option<&'a str>,
    pub tenant: Option<&'a str>,
    pub metadata: Value,
}

/// Append a new audit event. There is no update or delete for this table;
/// the append-only discipline (spec §3.4) is enforced by omission.
///
/// Takes a generic executor (rather than `&PgPool`) so callers can append
/// an audit event in the same transaction as the status write it
/// documents, e.g. lease claim/recovery.
pub async fn append_audit(
    executor: impl sqlx::PgExecutor<'_>,
    event: NewAuditEvent<'_>,
) -> Result<AuditEvent> {
    let row = sqlx::query_as::<_, AuditEvent>(
        "INSERT INTO audit_events (event_kind, resource_id, user_hash, tenant, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(event.event_kind)
    .bind(event.resource_id)
    .bind(event.user_hash)
    .bind(event.tenant)
    .bind(event.metadata)
    .fetch_one(executor)
    .await
    .with_context(|| format!("failed to append audit event for resource {}", event.resource_id))?;

    Ok(row)
}

/// List all audit events for a given resource (task or subtask id), ordered
/// by `at` ascending.
pub async fn list_events_for_resource(pool: &PgPool, resource_id: Uuid) -> Result<Vec<AuditEvent>> {
    let events = sqlx::query_as::<_, AuditEvent>(
        "SELECT * FROM audit_events WHERE resource_id = $1 ORDER BY at ASC",
    )
    .bind(resource_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list audit events for resource {resource_id}"))?;

    Ok(events)
}

/// Count events for a resource of a given kind (used by idempotence tests,
/// spec §8 "Applying the terminal write twice").
pub async fn count_events_for_resource_kind(
    pool: &PgPool,
    resource_id: Uuid,
    kind: AuditEventKind,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM audit_events WHERE resource_id = $1 AND event_kind = $2",
    )
    .bind(resource_id)
    .bind(kind)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to count audit events for resource {resource_id}"))?;

    Ok(row.0)
}
