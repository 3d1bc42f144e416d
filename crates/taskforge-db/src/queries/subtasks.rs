//! Database query functions for the `subtasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Subtask, TaskStatus};

/// Fields used by the orchestrator to create a new subtask (spec §4.6 step 4a).
pub struct NewSubtask<'a> {
    pub parent_id: Uuid,
    pub agent_type: &'a str,
    pub iteration: i32,
    pub step_name: Option<&'a str>,
    pub input: serde_json::Value,
    pub user_hash: Option<&'a str>,
    pub tenant: Option<&'a str>,
    pub trace_id: Option<&'a str>,
    pub max_tries: i32,
}

/// Insert a new subtask row with `status = pending`, `try_count = 0`.
///
/// `kind` is derived as `agent:<agent_type>` since subtasks always execute a
/// single agent step.
pub async fn insert_subtask(pool: &PgPool, new: NewSubtask<'_>) -> Result<Subtask> {
    let kind = format!("agent:{}", new.agent_type);
    let subtask = sqlx::query_as::<_, Subtask>(
        "INSERT INTO subtasks \
            (parent_id, agent_type, iteration, step_name, kind, status, input, \
             user_hash, tenant, trace_id, try_count, max_tries) \
         VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9, 0, $10) \
         RETURNING *",
    )
    .bind(new.parent_id)
    .bind(new.agent_type)
    .bind(new.iteration)
    .bind(new.step_name)
    .bind(kind)
    .bind(new.input)
    .bind(new.user_hash)
    .bind(new.tenant)
    .bind(new.trace_id)
    .bind(new.max_tries)
    .fetch_one(pool)
    .await
    .context("failed to insert subtask")?;

    Ok(subtask)
}

/// Fetch a single subtask by ID.
pub async fn get_subtask(pool: &PgPool, id: Uuid) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch subtask")?;

    Ok(subtask)
}

/// List all subtasks belonging to a parent task, ordered by creation time.
///
/// Used for workflow drill-down (spec §6.2).
pub async fn list_subtasks_for_parent(pool: &PgPool, parent_id: Uuid) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE parent_id = $1 ORDER BY created_at ASC",
    )
    .bind(parent_id)
    .fetch_all(pool)
    .await
    .context("failed to list subtasks for parent")?;

    Ok(subtasks)
}

/// Write a terminal outcome to a subtask row and, in the same transaction,
/// roll its cost up into the parent task (spec §4.6 cost aggregation
/// invariant, I4).
#[allow(clippy::too_many_arguments)]
pub async fn write_terminal_and_roll_up_cost(
    pool: &PgPool,
    id: Uuid,
    parent_id: Uuid,
    status: TaskStatus,
    output: Option<serde_json::Value>,
    error: Option<&str>,
    model_used: Option<&str>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    total_cost: Decimal,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = $1, output = $2, error = $3, model_used = $4, \
             input_tokens = $5, output_tokens = $6, total_cost = total_cost + $7, \
             updated_at = now() \
         WHERE id = $8 AND status = 'running'",
    )
    .bind(status)
    .bind(output)
    .bind(error)
    .bind(model_used)
    .bind(input_tokens)
    .bind(output_tokens)
    .bind(total_cost)
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("failed to write terminal subtask status")?;

    if result.rows_affected() > 0 {
        super::tasks::add_cost(&mut *tx, parent_id, total_cost)
            .await
            .context("failed to roll subtask cost into parent")?;
    }

    tx.commit().await.context("failed to commit subtask terminal write")?;

    Ok(result.rows_affected())
}

/// Recover a single subtask row from `RUNNING` back to `PENDING`.
pub async fn recover_to_pending(executor: impl sqlx::PgExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'pending', locked_at = NULL, locked_by = NULL, lease_timeout = NULL, updated_at = now() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .execute(executor)
    .await
    .context("failed to recover subtask to pending")?;

    Ok(result.rows_affected())
}

/// Renew the lease on a subtask still held by `worker_id`.
pub async fn renew_lease(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    now: DateTime<Utc>,
    new_timeout: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET lease_timeout = $1, updated_at = now() \
         WHERE id = $2 AND status = 'running' AND locked_by = $3 AND lease_timeout > $4",
    )
    .bind(new_timeout)
    .bind(id)
    .bind(worker_id)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to renew subtask lease")?;

    Ok(result.rows_affected())
}

/// Fail a subtask (`PENDING` or lease-expired `RUNNING`) whose retry cap was
/// already spent when a claim attempt picked it up.
///
/// Takes a generic executor so it can run inside the claim transaction.
pub async fn fail_pending_exceeded_retries(executor: impl sqlx::PgExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'error', error = 'exceeded max retries', updated_at = now() \
         WHERE id = $1 AND status IN ('pending', 'running')",
    )
    .bind(id)
    .execute(executor)
    .await
    .context("failed to fail subtask at retry cap")?;

    Ok(result.rows_affected())
}
