//! Thin wrapper around [`taskforge_db::queries::audit`] so call sites in
//! this crate (TaskMachine, Orchestrator) don't reach into `taskforge-db`
//! types directly. Grounded on the teacher's `agent_events::insert_agent_event`
//! + `NewAgentEvent` pairing (spec §3.4, §4.9).

use anyhow::Result;
use sqlx::PgPool;
use taskforge_db::models::{AuditEvent, AuditEventKind};
use taskforge_db::queries::audit::{self, NewAuditEvent};
use uuid::Uuid;

/// Append an audit event for `resource_id` (spec §4.9 event table).
#[allow(clippy::too_many_arguments)]
pub async fn record(
    pool: &PgPool,
    event_kind: AuditEventKind,
    resource_id: Uuid,
    user_hash: Option<&str>,
    tenant: Option<&str>,
    metadata: serde_json::Value,
) -> Result<AuditEvent> {
    audit::append_audit(
        pool,
        NewAuditEvent {
            event_kind,
            resource_id,
            user_hash,
            tenant,
            metadata,
        },
    )
    .await
}
