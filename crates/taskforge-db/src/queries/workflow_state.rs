//! Database query functions for the `workflow_state` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::WorkflowState;

/// Insert a new workflow state row for a workflow-kind task (spec §4.6 step 2).
pub async fn insert_workflow_state(
    pool: &PgPool,
    parent_id: Uuid,
    workflow_name: &str,
    max_iterations: i32,
    accumulated: serde_json::Value,
) -> Result<WorkflowState> {
    let state = sqlx::query_as::<_, WorkflowState>(
        "INSERT INTO workflow_state (parent_id, workflow_name, max_iterations, accumulated) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(parent_id)
    .bind(workflow_name)
    .bind(max_iterations)
    .bind(accumulated)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow state")?;

    Ok(state)
}

/// Fetch workflow state by parent task id.
pub async fn get_workflow_state(pool: &PgPool, parent_id: Uuid) -> Result<Option<WorkflowState>> {
    let state = sqlx::query_as::<_, WorkflowState>(
        "SELECT * FROM workflow_state WHERE parent_id = $1",
    )
    .bind(parent_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch workflow state")?;

    Ok(state)
}

/// Advance `current_step`/`current_iteration` and merge into `accumulated`.
pub async fn advance(
    pool: &PgPool,
    parent_id: Uuid,
    current_step: i32,
    current_iteration: i32,
    accumulated: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_state \
         SET current_step = $1, current_iteration = $2, accumulated = $3, updated_at = now() \
         WHERE parent_id = $4",
    )
    .bind(current_step)
    .bind(current_iteration)
    .bind(accumulated)
    .bind(parent_id)
    .execute(pool)
    .await
    .context("failed to advance workflow state")?;

    Ok(())
}

/// Mark a workflow as converged (spec §4.6 step 4b).
pub async fn mark_converged(pool: &PgPool, parent_id: Uuid, accumulated: serde_json::Value) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_state \
         SET converged = true, accumulated = $1, updated_at = now() \
         WHERE parent_id = $2",
    )
    .bind(accumulated)
    .bind(parent_id)
    .execute(pool)
    .await
    .context("failed to mark workflow converged")?;

    Ok(())
}
