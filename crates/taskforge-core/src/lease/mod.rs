//! Claim, renew, and recover leases on task/subtask rows (spec §4.2).
//!
//! The claim query uses a `FOR UPDATE SKIP LOCKED` CTE so concurrent
//! claimants never block on each other and never double-claim a row.
//! Subtasks are preferred over tasks of the same age (tie-break: subtask
//! first, then task, then `created_at` ascending) by issuing the subtask
//! query first and only falling through to the task query when it finds
//! nothing.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use taskforge_db::models::{Subtask, Task};
use taskforge_db::queries::{audit, subtasks as subtasks_db, tasks as tasks_db};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;

/// Clock skew tolerance applied when deciding whether a lease has expired
/// (spec §4.2 "Edge cases / policy").
pub const LEASE_GRACE: Duration = Duration::seconds(5);

/// A claimed row, task or subtask, handed to [`crate::task_machine`].
pub enum ClaimedRow {
    Task(Task),
    Subtask(Subtask),
}

impl ClaimedRow {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Task(t) => t.id,
            Self::Subtask(s) => s.id,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Task(t) => &t.kind,
            Self::Subtask(s) => &s.kind,
        }
    }
}

pub struct LeaseManager<'a> {
    pool: &'a PgPool,
    clock: &'a dyn Clock,
}

impl<'a> LeaseManager<'a> {
    pub fn new(pool: &'a PgPool, clock: &'a dyn Clock) -> Self {
        Self { pool, clock }
    }

    /// Claim the next available row for `worker_id` (spec §4.2 algorithm).
    ///
    /// Returns `None` when nothing is claimable. A row whose `try_count`
    /// would exceed `max_tries` is instead failed in place
    /// (`PENDING -> ERROR`, "exceeded max retries") and excluded from the
    /// result.
    pub async fn claim_next(&self, worker_id: &str, lease_duration: Duration) -> Result<Option<ClaimedRow>> {
        let now = self.clock.now();
        let lease_timeout = now + lease_duration;

        let mut tx = self.pool.begin().await.context("failed to begin claim transaction")?;

        if let Some(subtask) = Self::try_claim_subtask(&mut tx, worker_id, now, lease_timeout).await? {
            tx.commit().await.context("failed to commit subtask claim")?;
            info!(subtask_id = %subtask.id, worker_id, "claimed subtask");
            return Ok(Some(ClaimedRow::Subtask(subtask)));
        }

        if let Some(task) = Self::try_claim_task(&mut tx, worker_id, now, lease_timeout).await? {
            tx.commit().await.context("failed to commit task claim")?;
            info!(task_id = %task.id, worker_id, "claimed task");
            return Ok(Some(ClaimedRow::Task(task)));
        }

        tx.commit().await.context("failed to commit empty claim")?;
        Ok(None)
    }

    /// Select, lock, and claim-or-fail the oldest eligible task row.
    ///
    /// The candidate selection deliberately does *not* filter on `try_count`
    /// (spec §4.2 step 2 selects by status/lease alone): a row already at
    /// the retry cap must still be picked up here so it can be failed to
    /// `ERROR` (step 6), rather than sitting `PENDING` forever because no
    /// claim query ever looks at it again.
    async fn try_claim_task(
        tx: &mut Transaction<'_, Postgres>,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_timeout: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let candidate: Option<Task> = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks \
             WHERE (status = 'pending' OR (status = 'running' AND lease_timeout < $1)) \
             ORDER BY created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to select claimable task")?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };

        if candidate.try_count >= candidate.max_tries {
            tasks_db::fail_pending_exceeded_retries(&mut **tx, candidate.id).await?;
            warn!(task_id = %candidate.id, "task exceeded max retries at claim time");
            return Ok(None);
        }

        let task: Task = sqlx::query_as::<_, Task>(
            "UPDATE tasks \
             SET status = 'running', locked_by = $1, locked_at = $2, \
                 lease_timeout = $3, try_count = try_count + 1, updated_at = $2 \
             WHERE id = $4 \
             RETURNING *",
        )
        .bind(worker_id)
        .bind(now)
        .bind(lease_timeout)
        .bind(candidate.id)
        .fetch_one(&mut **tx)
        .await
        .context("failed to claim task")?;

        audit::append_audit(
            &mut **tx,
            audit::NewAuditEvent {
                event_kind: taskforge_db::models::AuditEventKind::TaskClaimed,
                resource_id: task.id,
                user_hash: task.user_hash.as_deref(),
                tenant: task.tenant.as_deref(),
                metadata: serde_json::json!({"worker_id": worker_id, "try_count": task.try_count}),
            },
        )
        .await?;

        Ok(Some(task))
    }

    async fn try_claim_subtask(
        tx: &mut Transaction<'_, Postgres>,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_timeout: DateTime<Utc>,
    ) -> Result<Option<Subtask>> {
        let candidate: Option<Subtask> = sqlx::query_as::<_, Subtask>(
            "SELECT * FROM subtasks \
             WHERE (status = 'pending' OR (status = 'running' AND lease_timeout < $1)) \
             ORDER BY created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to select claimable subtask")?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };

        if candidate.try_count >= candidate.max_tries {
            subtasks_db::fail_pending_exceeded_retries(&mut **tx, candidate.id).await?;
            warn!(subtask_id = %candidate.id, "subtask exceeded max retries at claim time");
            return Ok(None);
        }

        let subtask: Subtask = sqlx::query_as::<_, Subtask>(
            "UPDATE subtasks \
             SET status = 'running', locked_by = $1, locked_at = $2, \
                 lease_timeout = $3, try_count = try_count + 1, updated_at = $2 \
             WHERE id = $4 \
             RETURNING *",
        )
        .bind(worker_id)
        .bind(now)
        .bind(lease_timeout)
        .bind(candidate.id)
        .fetch_one(&mut **tx)
        .await
        .context("failed to claim subtask")?;

        audit::append_audit(
            &mut **tx,
            audit::NewAuditEvent {
                event_kind: taskforge_db::models::AuditEventKind::TaskClaimed,
                resource_id: subtask.id,
                user_hash: subtask.user_hash.as_deref(),
                tenant: subtask.tenant.as_deref(),
                metadata: serde_json::json!({"worker_id": worker_id, "try_count": subtask.try_count}),
            },
        )
        .await?;

        Ok(Some(subtask))
    }

    /// Renew a lease held by `worker_id`. Fails (returns `Ok(false)`) if the
    /// lease already expired or is held by a different worker; the caller
    /// must then treat the row as abandoned (spec §4.4 `LEASE_EXPIRED`).
    pub async fn renew_task_lease(&self, task_id: Uuid, worker_id: &str, lease_duration: Duration) -> Result<bool> {
        let now = self.clock.now();
        let rows = tasks_db::renew_lease(self.pool, task_id, worker_id, now, now + lease_duration).await?;
        Ok(rows > 0)
    }

    pub async fn renew_subtask_lease(&self, subtask_id: Uuid, worker_id: &str, lease_duration: Duration) -> Result<bool> {
        let now = self.clock.now();
        let rows = subtasks_db::renew_lease(self.pool, subtask_id, worker_id, now, now + lease_duration).await?;
        Ok(rows > 0)
    }

    /// Sweep expired leases back to `PENDING` (or `ERROR` when the retry cap
    /// is already spent). Invoked by `WorkerMachine` in `RECOVERING` on a
    /// fixed cadence (spec §4.2 "Recovery pass contract").
    pub async fn recover_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut recovered = 0usize;

        recovered += self.recover_expired_tasks(now).await?;
        recovered += self.recover_expired_subtasks(now).await?;

        Ok(recovered)
    }

    async fn recover_expired_tasks(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<Task> = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE status = 'running' AND lease_timeout < $1",
        )
        .bind(now)
        .fetch_all(self.pool)
        .await
        .context("failed to list expired tasks")?;

        let mut count = 0usize;
        for task in expired {
            let mut tx = self.pool.begin().await?;
            if task.try_count >= task.max_tries {
                sqlx::query(
                    "UPDATE tasks SET status = 'error', error = 'exceeded max retries', updated_at = $1 \
                     WHERE id = $2 AND status = 'running'",
                )
                .bind(now)
                .bind(task.id)
                .execute(&mut *tx)
                .await
                .context("failed to error out expired task at retry cap")?;
            } else {
                tasks_db::recover_to_pending(&mut *tx, task.id).await?;
                audit::append_audit(
                    &mut *tx,
                    audit::NewAuditEvent {
                        event_kind: taskforge_db::models::AuditEventKind::LeaseRecovered,
                        resource_id: task.id,
                        user_hash: task.user_hash.as_deref(),
                        tenant: task.tenant.as_deref(),
                        metadata: serde_json::json!({"previous_worker_id": task.locked_by}),
                    },
                )
                .await?;
            }
            tx.commit().await?;
            count += 1;
        }
        Ok(count)
    }

    async fn recover_expired_subtasks(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<Subtask> = sqlx::query_as::<_, Subtask>(
            "SELECT * FROM subtasks WHERE status = 'running' AND lease_timeout < $1",
        )
        .bind(now)
        .fetch_all(self.pool)
        .await
        .context("failed to list expired subtasks")?;

        let mut count = 0usize;
        for subtask in expired {
            let mut tx = self.pool.begin().await?;
            if subtask.try_count >= subtask.max_tries {
                sqlx::query(
                    "UPDATE subtasks SET status = 'error', error = 'exceeded max retries', updated_at = $1 \
                     WHERE id = $2 AND status = 'running'",
                )
                .bind(now)
                .bind(subtask.id)
                .execute(&mut *tx)
                .await
                .context("failed to error out expired subtask at retry cap")?;
            } else {
                subtasks_db::recover_to_pending(&mut *tx, subtask.id).await?;
                audit::append_audit(
                    &mut *tx,
                    audit::NewAuditEvent {
                        event_kind: taskforge_db::models::AuditEventKind::LeaseRecovered,
                        resource_id: subtask.id,
                        user_hash: subtask.user_hash.as_deref(),
                        tenant: subtask.tenant.as_deref(),
                        metadata: serde_json::json!({"previous_worker_id": subtask.locked_by}),
                    },
                )
                .await?;
            }
            tx.commit().await?;
            count += 1;
        }
        Ok(count)
    }

    /// Treat `now >= lease_timeout - LEASE_GRACE` as effectively expired to
    /// avoid double-processing near the boundary (spec §4.2).
    pub fn is_effectively_expired(&self, lease_timeout: DateTime<Utc>) -> bool {
        self.clock.now() >= lease_timeout - LEASE_GRACE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn grace_window_is_a_few_seconds() {
        assert_eq!(LEASE_GRACE, Duration::seconds(5));
    }

    #[test]
    fn effectively_expired_uses_grace_window() {
        let clock = SystemClock;
        let now = clock.now();
        // A dummy pool is never used by is_effectively_expired, but the
        // type requires one; exercised indirectly via lease module
        // integration tests instead. This unit test only checks the pure
        // time arithmetic via a local closure mirroring the method body.
        let lease_timeout = now + Duration::seconds(3);
        let effectively_expired = now >= lease_timeout - LEASE_GRACE;
        assert!(effectively_expired);
    }
}
