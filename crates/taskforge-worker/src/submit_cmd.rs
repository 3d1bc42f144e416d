//! `taskforge submit` command: insert a new task row (spec §6.1).

use anyhow::{Context, Result};
use sqlx::PgPool;
use taskforge_core::audit;
use taskforge_db::models::AuditEventKind;
use taskforge_db::queries::tasks::{self as tasks_db, NewTask};

/// Submit a new task. `input` must already be parsed JSON; `_trace_context`
/// inside it (if present) is lifted into the row's `trace_id` column
/// (spec §6.1's external-entry contract), the rest is stored verbatim.
pub async fn run_submit(
    pool: &PgPool,
    kind: &str,
    mut input: serde_json::Value,
    max_tries: i32,
) -> Result<()> {
    let trace_id = input
        .as_object_mut()
        .and_then(|obj| obj.remove("_trace_context"))
        .and_then(|v| v.as_str().map(str::to_string));

    let task = tasks_db::insert_task(
        pool,
        NewTask {
            kind,
            input,
            user_hash: None,
            tenant: None,
            trace_id: trace_id.as_deref(),
            max_tries,
        },
    )
    .await
    .context("failed to submit task")?;

    audit::record(
        pool,
        AuditEventKind::TaskSubmitted,
        task.id,
        task.user_hash.as_deref(),
        task.tenant.as_deref(),
        serde_json::json!({"kind": task.kind}),
    )
    .await
    .context("failed to append TaskSubmitted audit event")?;

    println!("Task submitted: {}", task.id);
    println!("  kind   = {}", task.kind);
    println!("  status = {}", task.status);

    Ok(())
}
