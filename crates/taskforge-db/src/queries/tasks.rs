//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Fields accepted at submission time (spec §6.1).
pub struct NewTask<'a> {
    pub kind: &'a str,
    pub input: serde_json::Value,
    pub user_hash: Option<&'a str>,
    pub tenant: Option<&'a str>,
    pub trace_id: Option<&'a str>,
    pub max_tries: i32,
}

/// Insert a new task row with `status = pending`, `try_count = 0`.
pub async fn insert_task(pool: &PgPool, new: NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (kind, status, input, user_hash, tenant, trace_id, try_count, max_tries) \
         VALUES ($1, 'pending', $2, $3, $4, $5, 0, $6) \
         RETURNING *",
    )
    .bind(new.kind)
    .bind(new.input)
    .bind(new.user_hash)
    .bind(new.tenant)
    .bind(new.trace_id)
    .bind(new.max_tries)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Write a terminal outcome (`DONE` or `ERROR`) to a task row.
///
/// Optimistic locking via `WHERE status = 'running'`: rejected (zero rows
/// affected) if the row is no longer `RUNNING`, e.g. a concurrent lease
/// recovery already moved it back to `PENDING`.
#[allow(clippy::too_many_arguments)]
pub async fn write_terminal(
    pool: &PgPool,
    id: Uuid,
    status: TaskStatus,
    output: Option<serde_json::Value>,
    error: Option<&str>,
    model_used: Option<&str>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    total_cost: Decimal,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
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
    .execute(pool)
    .await
    .context("failed to write terminal task status")?;

    Ok(result.rows_affected())
}

/// Add `amount` to a task's `total_cost` (used by subtask cost aggregation).
pub async fn add_cost(
    executor: impl sqlx::PgExecutor<'_>,
    id: Uuid,
    amount: Decimal,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET total_cost = total_cost + $1, updated_at = now() WHERE id = $2")
        .bind(amount)
        .bind(id)
        .execute(executor)
        .await
        .context("failed to add cost to task")?;

    Ok(result.rows_affected())
}

/// Fail a row (`PENDING` or lease-expired `RUNNING`) whose retry cap was
/// already spent when a claim attempt picked it up (spec §4.2 step 6).
///
/// Takes a generic executor so it can run inside the claim transaction.
pub async fn fail_pending_exceeded_retries(executor: impl sqlx::PgExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'error', error = 'exceeded max retries', updated_at = now() \
         WHERE id = $1 AND status IN ('pending', 'running')",
    )
    .bind(id)
    .execute(executor)
    .await
    .context("failed to fail task at retry cap")?;

    Ok(result.rows_affected())
}

/// Recover a single row from `RUNNING` back to `PENDING` whose lease expired.
pub async fn recover_to_pending(
    executor: impl sqlx::PgExecutor<'_>,
    id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', locked_at = NULL, locked_by = NULL, lease_timeout = NULL, updated_at = now() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .execute(executor)
    .await
    .context("failed to recover task to pending")?;
    Ok(result.rows_affected())
}

/// Renew the lease on a task still held by `worker_id`.
pub async fn renew_lease(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    now: DateTime<Utc>,
    new_timeout: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET lease_timeout = $1, updated_at = now() \
         WHERE id = $2 AND status = 'running' AND locked_by = $3 AND lease_timeout > $4",
    )
    .bind(new_timeout)
    .bind(id)
    .bind(worker_id)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to renew task lease")?;

    Ok(result.rows_affected())
}
