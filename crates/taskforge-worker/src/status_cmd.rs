//! `taskforge status` command: read-only task/plan inspection (spec §6.2).

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use taskforge_db::queries::subtasks as subtasks_db;
use taskforge_db::queries::tasks as tasks_db;
use uuid::Uuid;

/// Show a single task's status, or (with `as_plan`) the task plus every
/// subtask the orchestrator spawned for it, ordered by iteration/step.
pub async fn run_status(pool: &PgPool, task_id_str: &str, as_plan: bool) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = tasks_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task {}", task.id);
    println!("  kind       = {}", task.kind);
    println!("  status     = {}", task.status);
    println!("  try_count  = {}/{}", task.try_count, task.max_tries);
    println!("  total_cost = {}", task.total_cost);
    if let Some(model) = &task.model_used {
        println!("  model_used = {model}");
    }
    if let Some(output) = &task.output {
        println!("  output     = {output}");
    }
    if let Some(error) = &task.error {
        println!("  error      = {error}");
    }

    if !as_plan {
        return Ok(());
    }

    if !task.kind.starts_with("workflow:") {
        bail!("task {task_id} is not a workflow task, nothing to drill into with --plan");
    }

    let mut subtasks = subtasks_db::list_subtasks_for_parent(pool, task_id).await?;
    subtasks.sort_by_key(|s| (s.iteration, s.created_at));

    println!();
    println!("Subtasks ({}):", subtasks.len());
    for subtask in &subtasks {
        println!(
            "  [{:>2}] {:<20} {:<8} {}",
            subtask.iteration,
            subtask.step_name.as_deref().unwrap_or(&subtask.agent_type),
            subtask.status,
            subtask.id,
        );
    }

    Ok(())
}
