//! Declarative multi-step workflow execution (spec §4.6).
//!
//! Invoked by [`crate::task_machine`] when a `Task`'s `kind` is
//! `workflow:<name>`. Each step becomes a `Subtask` row claimed and run by
//! *some* worker through the ordinary lease protocol (§4.2); this module
//! only creates those rows and polls for their terminal status, the same
//! bounded-backoff way `WorkerMachine` polls for claimable work (§4.5).
//! Grounded on the teacher's `orchestrator::run_orchestrator` for the
//! overall shape (a driving loop that fans work out and waits on terminal
//! status), adapted from process-level fan-out via `mpsc`/`Semaphore` to
//! row-level fan-out via the shared `subtasks` table, since here the
//! workers executing each step are separate processes, not in-process tasks.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde_json::Value;
use taskforge_db::models::{AuditEventKind, Task, TaskStatus, WorkflowCoordination};
use taskforge_db::queries::{subtasks as subtasks_db, workflow_state as workflow_state_db};
use tracing::{info, warn};

use crate::audit;
use crate::backoff;
use crate::lease::LeaseManager;
use crate::task_machine::TaskMachineContext;
use crate::workflow::{WorkflowDefinition, lookup_convergence_check};

/// Run the named workflow for `task` to completion (spec §4.6 steps 1-5).
///
/// Returns the parent's final output on success. On a subtask `ERROR` or
/// any other failure, returns `Err` so the caller's `TaskMachine` reports
/// the task as failed (spec §4.6 step 4a "fail the whole workflow").
pub async fn run_workflow(
    ctx: &TaskMachineContext<'_>,
    task: &Task,
    workflow_name: &str,
) -> Result<Value> {
    let definition = ctx
        .workflows
        .get(workflow_name)
        .with_context(|| format!("workflow not found: {workflow_name:?}"))?;

    let mut accumulated = serde_json::json!({"topic": task.input.clone()});

    workflow_state_db::insert_workflow_state(
        ctx.pool,
        task.id,
        &definition.name,
        definition.max_iterations,
        accumulated.clone(),
    )
    .await
    .context("failed to create workflow state")?;

    audit::record(
        ctx.pool,
        AuditEventKind::WorkflowStarted,
        task.id,
        task.user_hash.as_deref(),
        task.tenant.as_deref(),
        serde_json::json!({"workflow_name": definition.name}),
    )
    .await
    .context("failed to append WorkflowStarted audit event")?;

    let mut previous_iteration_feedback: Option<Value> = None;
    let mut converged = false;
    let mut iterations_run = 0;

    'workflow: for iteration in 1..=definition.max_iterations {
        iterations_run = iteration;

        for (step_index, step) in definition.steps.iter().enumerate() {
            let input = project(&accumulated, step_index, previous_iteration_feedback.as_ref());

            let subtask = subtasks_db::insert_subtask(
                ctx.pool,
                subtasks_db::NewSubtask {
                    parent_id: task.id,
                    agent_type: &step.agent_type,
                    iteration,
                    step_name: Some(&step.name),
                    input,
                    user_hash: task.user_hash.as_deref(),
                    tenant: task.tenant.as_deref(),
                    trace_id: task.trace_id.as_deref(),
                    max_tries: task.max_tries,
                },
            )
            .await
            .context("failed to insert workflow step subtask")?;

            let terminal = await_subtask_terminal(ctx, task.id, subtask.id).await?;

            if terminal.status == TaskStatus::Error {
                bail!(
                    "workflow {:?} failed at step {:?} (iteration {}): {}",
                    definition.name,
                    step.name,
                    iteration,
                    terminal.error.as_deref().unwrap_or("unknown subtask error")
                );
            }

            let output = terminal.output.clone().unwrap_or(Value::Null);
            merge_step_output(&mut accumulated, &step.name, output.clone());

            if step_index == definition.steps.len() - 1 {
                previous_iteration_feedback = Some(output);
            }

            workflow_state_db::advance(ctx.pool, task.id, step_index as i32, iteration, accumulated.clone())
                .await
                .context("failed to advance workflow state")?;

            if ctx.shutdown.is_cancelled() {
                info!(
                    task_id = %task.id,
                    workflow_name = %definition.name,
                    iteration,
                    step = %step.name,
                    "shutdown requested, stopping workflow after current subtask and leaving remaining steps unqueued"
                );
                break 'workflow;
            }
        }

        match definition.coordination {
            WorkflowCoordination::IterativeRefinement => {
                if evaluate_convergence(&definition, &accumulated) {
                    converged = true;
                    workflow_state_db::mark_converged(ctx.pool, task.id, accumulated.clone())
                        .await
                        .context("failed to mark workflow converged")?;
                    audit::record(
                        ctx.pool,
                        AuditEventKind::WorkflowConverged,
                        task.id,
                        task.user_hash.as_deref(),
                        task.tenant.as_deref(),
                        serde_json::json!({"iteration": iteration}),
                    )
                    .await
                    .context("failed to append WorkflowConverged audit event")?;
                    break 'workflow;
                }
            }
            WorkflowCoordination::Sequential => break 'workflow,
        }
    }

    let partial = ctx.shutdown.is_cancelled();

    info!(
        task_id = %task.id,
        workflow_name = %definition.name,
        iterations_run,
        converged,
        partial,
        "workflow execution finished"
    );

    Ok(serde_json::json!({
        "result": accumulated,
        "iterations_run": iterations_run,
        "converged": converged,
        "partial": partial,
    }))
}

/// Build a step's input from the accumulated workflow state (spec §4.6
/// "Iteration handoff"): the first step of any iteration after the first
/// receives the prior iteration's final step output as `previous_feedback`.
fn project(accumulated: &Value, step_index: usize, previous_feedback: Option<&Value>) -> Value {
    let mut input = accumulated.clone();
    if step_index == 0 {
        if let (Value::Object(map), Some(feedback)) = (&mut input, previous_feedback) {
            map.insert("previous_feedback".to_string(), feedback.clone());
        }
    }
    input
}

fn merge_step_output(accumulated: &mut Value, step_name: &str, output: Value) {
    if let Value::Object(map) = accumulated {
        map.insert(step_name.to_string(), output);
    }
}

/// Evaluate `definition.convergence_check` on `accumulated` (spec §4.6 step
/// 4b). An unregistered check name is treated as never-converged, matching
/// the "first success wins / unknowns fail closed" posture used elsewhere
/// in the registry design (§4.7).
fn evaluate_convergence(definition: &WorkflowDefinition, accumulated: &Value) -> bool {
    let Some(check_name) = definition.convergence_check.as_deref() else {
        warn!(workflow_name = %definition.name, "iterative workflow has no convergence_check configured");
        return false;
    };

    // spec §4.6 step 4b: "accumulated[last_step].approved == true" -- the
    // check inspects the last step's own output, not the top-level
    // accumulated object it lives inside.
    let Some(last_step) = definition.steps.last() else {
        return false;
    };
    let last_step_output = accumulated.get(&last_step.name).unwrap_or(&Value::Null);

    match lookup_convergence_check(check_name) {
        Some(check) => check(last_step_output),
        None => {
            warn!(workflow_name = %definition.name, check_name, "unknown convergence_check, treating as not converged");
            false
        }
    }
}

/// Poll the store until a subtask reaches a terminal status, using the
/// same bounded exponential backoff as `WorkerMachine`'s idle-poll loop
/// (spec §4.6: "bounded interval, same backoff as §4.5").
///
/// Also renews `task_id`'s own lease on each iteration it isn't busy
/// waiting out a shutdown (spec §5: a multi-step or iterative workflow can
/// easily outlive one lease period, and without renewal a recovery sweep
/// would reset the still-running parent to `PENDING` and cause a second
/// worker to re-run the whole workflow, spec §8 I8). Once `ctx.shutdown` is
/// cancelled, polling continues -- to give the in-flight subtask a chance
/// to reach terminal (spec §5 "current subtask transitions to terminal") --
/// but only for up to `ctx.shutdown_timeout`, after which this returns an
/// error so the caller can report the task failed rather than block past
/// the worker's `shutdown_timeout` budget (spec §4.5 invariant).
async fn await_subtask_terminal(
    ctx: &TaskMachineContext<'_>,
    task_id: uuid::Uuid,
    subtask_id: uuid::Uuid,
) -> Result<taskforge_db::models::Subtask> {
    let manager = LeaseManager::new(ctx.pool, ctx.clock);
    let mut interval = backoff::FLOOR;
    let mut shutdown_deadline: Option<DateTime<Utc>> = None;

    loop {
        let subtask = subtasks_db::get_subtask(ctx.pool, subtask_id)
            .await?
            .context("subtask disappeared while orchestrator was polling")?;

        if subtask.status.is_terminal() {
            return Ok(subtask);
        }

        if ctx.shutdown.is_cancelled() {
            let deadline = *shutdown_deadline.get_or_insert_with(|| ctx.clock.now() + ctx.shutdown_timeout);
            if ctx.clock.now() >= deadline {
                bail!("shutdown timeout elapsed while waiting for subtask {subtask_id} to reach terminal");
            }
        } else {
            match manager.renew_task_lease(task_id, ctx.worker_id, ctx.lease_duration).await {
                Ok(true) => {}
                Ok(false) => warn!(task_id = %task_id, "failed to renew parent workflow lease; it may have already been reclaimed by another worker"),
                Err(err) => warn!(task_id = %task_id, error = %err, "failed to renew parent workflow lease while polling subtask"),
            }
        }

        let sleep_for = interval.to_std().unwrap_or(std::time::Duration::from_millis(200));
        tokio::time::sleep(sleep_for).await;
        interval = backoff::next(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStep;

    fn sample_definition(coordination: WorkflowCoordination) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "research_report".to_string(),
            description: "test".to_string(),
            coordination,
            max_iterations: 2,
            convergence_check: Some("assessment_approved".to_string()),
            steps: vec![
                WorkflowStep {
                    agent_type: "research".to_string(),
                    name: "research".to_string(),
                },
                WorkflowStep {
                    agent_type: "assessment".to_string(),
                    name: "assessment".to_string(),
                },
            ],
        }
    }

    #[test]
    fn project_first_step_attaches_previous_feedback() {
        let accumulated = serde_json::json!({"topic": "solar panels"});
        let feedback = serde_json::json!({"approved": false, "notes": "needs more depth"});
        let input = project(&accumulated, 0, Some(&feedback));
        assert_eq!(input["previous_feedback"], feedback);
        assert_eq!(input["topic"], "solar panels");
    }

    #[test]
    fn project_non_first_step_ignores_feedback() {
        let accumulated = serde_json::json!({"topic": "solar panels"});
        let feedback = serde_json::json!({"approved": false});
        let input = project(&accumulated, 1, Some(&feedback));
        assert!(input.get("previous_feedback").is_none());
    }

    #[test]
    fn project_without_feedback_is_passthrough() {
        let accumulated = serde_json::json!({"topic": "solar panels"});
        let input = project(&accumulated, 0, None);
        assert_eq!(input, accumulated);
    }

    #[test]
    fn merge_step_output_inserts_under_step_name() {
        let mut accumulated = serde_json::json!({"topic": "solar panels"});
        merge_step_output(&mut accumulated, "research", serde_json::json!({"facts": ["a", "b"]}));
        assert_eq!(accumulated["research"]["facts"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn evaluate_convergence_true_when_approved() {
        let definition = sample_definition(WorkflowCoordination::IterativeRefinement);
        let accumulated = serde_json::json!({"topic": "x", "assessment": {"approved": true}});
        assert!(evaluate_convergence(&definition, &accumulated));
    }

    #[test]
    fn evaluate_convergence_false_when_not_approved() {
        let definition = sample_definition(WorkflowCoordination::IterativeRefinement);
        let accumulated = serde_json::json!({"topic": "x", "assessment": {"approved": false}});
        assert!(!evaluate_convergence(&definition, &accumulated));
    }

    #[test]
    fn evaluate_convergence_ignores_top_level_approved() {
        // Regression: the check must look at accumulated[last_step], not a
        // stray top-level "approved" key (spec §4.6 step 4b).
        let definition = sample_definition(WorkflowCoordination::IterativeRefinement);
        let accumulated = serde_json::json!({"approved": true, "assessment": {"approved": false}});
        assert!(!evaluate_convergence(&definition, &accumulated));
    }

    #[test]
    fn evaluate_convergence_false_when_unconfigured() {
        let mut definition = sample_definition(WorkflowCoordination::IterativeRefinement);
        definition.convergence_check = None;
        let accumulated = serde_json::json!({"assessment": {"approved": true}});
        assert!(!evaluate_convergence(&definition, &accumulated));
    }

    #[test]
    fn evaluate_convergence_false_when_unknown_check() {
        let mut definition = sample_definition(WorkflowCoordination::IterativeRefinement);
        definition.convergence_check = Some("not_a_real_check".to_string());
        let accumulated = serde_json::json!({"assessment": {"approved": true}});
        assert!(!evaluate_convergence(&definition, &accumulated));
    }
}
