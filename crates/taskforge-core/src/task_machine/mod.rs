//! Per-work-item state machine: drives one freshly-claimed row through
//! `PROCESSING -> REPORTING -> terminal` (spec §4.4).
//!
//! `CLAIMING` itself already happened inside `LeaseManager::claim_next`
//! (spec §4.2) by the time a [`ClaimedRow`] reaches this module, so
//! `run_task` begins life already past `CLAIM_OK`. Grounded on the
//! teacher's `lifecycle::run_agent_lifecycle`: a linear sequence of steps,
//! each logged, ending in one of a small set of named terminal outcomes.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use taskforge_db::models::{AuditEventKind, Subtask, Task, TaskStatus};
use taskforge_db::queries::{subtasks as subtasks_db, tasks as tasks_db};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::lease::{ClaimedRow, LEASE_GRACE};
use crate::notifier::{NotifyPayload, Notifier, notify_fire_and_forget};
use crate::orchestrator;
use crate::registry::Registry;
use crate::registry::agent::{Agent, AgentOutput};
use crate::registry::tool::Tool;
use crate::registry::workflow::WorkflowRegistry;
use crate::state::TaskStateMachine;
use crate::{audit, backoff};

/// Terminal state a [`run_task`] call reached (spec §4.4: `COMPLETED`,
/// `FAILED`, `ABANDONED` are the three terminal states; `CLAIMING` and
/// `REPORTING` are internal to this function's execution).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMachineState {
    Completed,
    Failed,
    Abandoned,
}

/// Shared dependencies threaded through one `run_task` call and recursively
/// into the Orchestrator for `workflow:<name>` rows.
pub struct TaskMachineContext<'a> {
    pub pool: &'a PgPool,
    pub clock: &'a dyn Clock,
    pub worker_id: &'a str,
    pub lease_duration: Duration,
    pub agents: &'a Registry<dyn Agent>,
    pub tools: &'a Registry<dyn Tool>,
    pub workflows: &'a WorkflowRegistry,
    pub notifier: Arc<dyn Notifier>,
    /// Cancelled once the worker has received a shutdown request (spec §4.5).
    /// Checked before `PROCESSING` begins and, for `workflow:` rows, at each
    /// subtask-polling interval inside the orchestrator (spec §5).
    pub shutdown: &'a CancellationToken,
    /// Budget for a `PROCESSING` row to reach a terminal report once
    /// `shutdown` is cancelled (spec §4.5 `shutdown_timeout`, spec.md:270,343).
    pub shutdown_timeout: Duration,
}

/// The outcome of one `PROCESSING` run, prior to being written to the row.
#[derive(Debug)]
struct WorkResult {
    output: Option<serde_json::Value>,
    error: Option<String>,
    model_used: Option<String>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cost: Decimal,
}

impl WorkResult {
    fn from_agent_output(result: AgentOutput) -> Self {
        Self {
            output: Some(result.output),
            error: None,
            model_used: result.usage.model_used,
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
            cost: result.usage.cost,
        }
    }

    fn from_plain_output(output: serde_json::Value) -> Self {
        Self {
            output: Some(output),
            error: None,
            model_used: None,
            input_tokens: None,
            output_tokens: None,
            cost: Decimal::ZERO,
        }
    }

    fn from_error(message: String) -> Self {
        Self {
            output: None,
            error: Some(message),
            model_used: None,
            input_tokens: None,
            output_tokens: None,
            cost: Decimal::ZERO,
        }
    }
}

/// Drive a claimed [`Task`] or [`Subtask`] row to terminal (spec §4.4).
pub async fn run_task(ctx: &TaskMachineContext<'_>, row: ClaimedRow) -> Result<TaskMachineState> {
    match row {
        ClaimedRow::Task(task) => run_task_row(ctx, task).await,
        ClaimedRow::Subtask(subtask) => run_subtask_row(ctx, subtask).await,
    }
}

/// `true` once `now` is within [`LEASE_GRACE`] of (or past) `lease_timeout`.
/// Checked on entry to and exit from `PROCESSING` (spec §4.4 invariant,
/// `LEASE_EXPIRED` event).
fn lease_expired(now: DateTime<Utc>, lease_timeout: Option<DateTime<Utc>>) -> bool {
    match lease_timeout {
        Some(timeout) => now >= timeout - LEASE_GRACE,
        None => false,
    }
}

async fn run_task_row(ctx: &TaskMachineContext<'_>, task: Task) -> Result<TaskMachineState> {
    if lease_expired(ctx.clock.now(), task.lease_timeout) {
        warn!(task_id = %task.id, "lease expired before processing started");
        return Ok(TaskMachineState::Abandoned);
    }

    if ctx.shutdown.is_cancelled() {
        warn!(task_id = %task.id, "shutdown requested before processing started, abandoning claim");
        return Ok(TaskMachineState::Abandoned);
    }

    let result = if let Some(workflow_name) = task.kind.strip_prefix("workflow:") {
        run_workflow_kind(ctx, &task, workflow_name).await
    } else {
        run_work_body(ctx, &task.kind, &task.input).await
    };

    if lease_expired(ctx.clock.now(), task.lease_timeout) {
        warn!(task_id = %task.id, "lease expired during processing");
        return Ok(TaskMachineState::Abandoned);
    }

    report_task(ctx, &task, result).await
}

async fn run_subtask_row(ctx: &TaskMachineContext<'_>, subtask: Subtask) -> Result<TaskMachineState> {
    if lease_expired(ctx.clock.now(), subtask.lease_timeout) {
        warn!(subtask_id = %subtask.id, "lease expired before processing started");
        return Ok(TaskMachineState::Abandoned);
    }

    if ctx.shutdown.is_cancelled() {
        warn!(subtask_id = %subtask.id, "shutdown requested before processing started, abandoning claim");
        return Ok(TaskMachineState::Abandoned);
    }

    let result = run_work_body(ctx, &subtask.kind, &subtask.input).await;

    if lease_expired(ctx.clock.now(), subtask.lease_timeout) {
        warn!(subtask_id = %subtask.id, "lease expired during processing");
        return Ok(TaskMachineState::Abandoned);
    }

    report_subtask(ctx, &subtask, result).await
}

async fn run_workflow_kind(ctx: &TaskMachineContext<'_>, task: &Task, workflow_name: &str) -> WorkResult {
    match orchestrator::run_workflow(ctx, task, workflow_name).await {
        Ok(output) => WorkResult::from_plain_output(output),
        Err(err) => WorkResult::from_error(format!("{err:#}")),
    }
}

/// `agent:<type>` and `tool:<name>` dispatch (spec §4.4 "Execution
/// contract"). `workflow:<name>` is handled by the caller since it needs
/// the full [`Task`] row.
async fn run_work_body(ctx: &TaskMachineContext<'_>, kind: &str, input: &serde_json::Value) -> WorkResult {
    match dispatch(ctx.agents, ctx.tools, kind, input).await {
        Ok(result) => result,
        Err(err) => WorkResult::from_error(format!("{err:#}")),
    }
}

/// `agent:<type>`/`tool:<name>` dispatch, factored out of [`run_work_body`]
/// so it can be exercised without a live database connection: it only
/// needs the two in-memory registries, never the pool.
async fn dispatch(
    agents: &Registry<dyn Agent>,
    tools: &Registry<dyn Tool>,
    kind: &str,
    input: &serde_json::Value,
) -> Result<WorkResult> {
    if let Some(agent_type) = kind.strip_prefix("agent:") {
        let agent = agents
            .get(agent_type)
            .with_context(|| format!("no agent registered for type {agent_type:?}"))?;
        let output = agent.run(input).await?;
        return Ok(WorkResult::from_agent_output(output));
    }

    if let Some(tool_name) = kind.strip_prefix("tool:") {
        let tool = tools
            .get(tool_name)
            .with_context(|| format!("no tool registered under name {tool_name:?}"))?;
        let output = tool.run(input).await?;
        return Ok(WorkResult::from_plain_output(output));
    }

    anyhow::bail!("unrecognized task kind: {kind:?}")
}

async fn report_task(ctx: &TaskMachineContext<'_>, task: &Task, result: WorkResult) -> Result<TaskMachineState> {
    let status = if result.error.is_none() { TaskStatus::Done } else { TaskStatus::Error };

    // spec §7 `InvalidTransition`: a programming error, never recovered --
    // the process exits so the bug is observable. RUNNING is the only
    // status a freshly-claimed row can be in at this point; anything else
    // means a caller upstream already violated the state graph (spec §4.3).
    TaskStateMachine::validate(TaskStatus::Running, status)
        .expect("report_task called with a transition outside the §4.3 graph");

    let rows_affected = match write_task_terminal_with_retry(ctx.pool, task.id, status, &result).await {
        Some(rows) => rows,
        None => {
            error!(task_id = %task.id, "terminal write failed after retry, giving up");
            return Ok(TaskMachineState::Failed);
        }
    };

    if rows_affected == 0 {
        warn!(task_id = %task.id, "terminal write affected no rows; row left the running state underneath us");
        return Ok(TaskMachineState::Failed);
    }

    let (event_kind, metadata) = if status == TaskStatus::Done {
        (
            AuditEventKind::TaskDone,
            serde_json::json!({"cost": result.cost.to_string(), "model_used": result.model_used}),
        )
    } else {
        (AuditEventKind::TaskError, serde_json::json!({"error": result.error}))
    };

    if let Err(err) = audit::record(
        ctx.pool,
        event_kind,
        task.id,
        task.user_hash.as_deref(),
        task.tenant.as_deref(),
        metadata,
    )
    .await
    {
        warn!(task_id = %task.id, error = %err, "failed to append audit event");
    }

    let payload = match (&result.output, &result.error) {
        (Some(output), _) => NotifyPayload::Output(output.clone()),
        (None, Some(message)) => NotifyPayload::Error(message.clone()),
        (None, None) => NotifyPayload::Error("task reported neither output nor error".to_string()),
    };
    notify_fire_and_forget(Arc::clone(&ctx.notifier), task.id, status, payload);

    info!(task_id = %task.id, %status, "task reached terminal state");

    Ok(if status == TaskStatus::Done {
        TaskMachineState::Completed
    } else {
        TaskMachineState::Failed
    })
}

async fn report_subtask(ctx: &TaskMachineContext<'_>, subtask: &Subtask, result: WorkResult) -> Result<TaskMachineState> {
    let status = if result.error.is_none() { TaskStatus::Done } else { TaskStatus::Error };

    TaskStateMachine::validate(TaskStatus::Running, status)
        .expect("report_subtask called with a transition outside the §4.3 graph");

    let rows_affected = match write_subtask_terminal_with_retry(ctx.pool, subtask, status, &result).await {
        Some(rows) => rows,
        None => {
            error!(subtask_id = %subtask.id, "terminal write failed after retry, giving up");
            return Ok(TaskMachineState::Failed);
        }
    };

    if rows_affected == 0 {
        warn!(subtask_id = %subtask.id, "terminal write affected no rows; row left the running state underneath us");
        return Ok(TaskMachineState::Failed);
    }

    if status == TaskStatus::Done {
        let metadata = serde_json::json!({
            "iteration": subtask.iteration,
            "step_name": subtask.step_name,
        });
        if let Err(err) = audit::record(
            ctx.pool,
            AuditEventKind::SubtaskDone,
            subtask.id,
            subtask.user_hash.as_deref(),
            subtask.tenant.as_deref(),
            metadata,
        )
        .await
        {
            warn!(subtask_id = %subtask.id, error = %err, "failed to append audit event");
        }
    }

    info!(subtask_id = %subtask.id, %status, "subtask reached terminal state");

    Ok(if status == TaskStatus::Done {
        TaskMachineState::Completed
    } else {
        TaskMachineState::Failed
    })
}

/// Write the terminal row once, retry once on a transport-level error, then
/// give up (spec §4.4 "Failure handling": "the core retries the write once
/// then gives up and logs"). `None` means both attempts failed; `Some(n)`
/// is the `rows_affected` from whichever attempt succeeded.
async fn write_task_terminal_with_retry(
    pool: &PgPool,
    id: uuid::Uuid,
    status: TaskStatus,
    result: &WorkResult,
) -> Option<u64> {
    for attempt in 1..=2 {
        match tasks_db::write_terminal(
            pool,
            id,
            status,
            result.output.clone(),
            result.error.as_deref(),
            result.model_used.as_deref(),
            result.input_tokens,
            result.output_tokens,
            result.cost,
        )
        .await
        {
            Ok(rows) => return Some(rows),
            Err(err) if attempt == 1 => {
                warn!(task_id = %id, error = %err, "terminal write failed, retrying once");
            }
            Err(_) => return None,
        }
    }
    None
}

async fn write_subtask_terminal_with_retry(
    pool: &PgPool,
    subtask: &Subtask,
    status: TaskStatus,
    result: &WorkResult,
) -> Option<u64> {
    for attempt in 1..=2 {
        match subtasks_db::write_terminal_and_roll_up_cost(
            pool,
            subtask.id,
            subtask.parent_id,
            status,
            result.output.clone(),
            result.error.as_deref(),
            result.model_used.as_deref(),
            result.input_tokens,
            result.output_tokens,
            result.cost,
        )
        .await
        {
            Ok(rows) => return Some(rows),
            Err(err) if attempt == 1 => {
                warn!(subtask_id = %subtask.id, error = %err, "terminal write failed, retrying once");
            }
            Err(_) => return None,
        }
    }
    None
}
