//! `taskforge worker run` command: wire a live pool and populated
//! registries into a [`taskforge_core::worker::WorkerContext`] and run it
//! to `STOPPED` (spec §4.5, SPEC_FULL.md §12).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use taskforge_core::clock::SystemClock;
use taskforge_core::notifier::NullNotifier;
use taskforge_core::registry::Registry;
use taskforge_core::registry::workflow::WorkflowRegistry;
use taskforge_core::worker::{self, WorkerContext};
use taskforge_core::workflow::parser::parse_workflow_toml;

use crate::config::TaskforgeConfig;

/// Load every `*.toml` file in `dir` as a workflow definition (spec §6.3:
/// "parsed at worker startup; malformed definitions abort startup with a
/// line-referenced error"). Returns an empty, valid registry when `dir`
/// does not exist -- a worker with no workflow-typed tasks needs none.
fn load_workflows(dir: &std::path::Path) -> Result<WorkflowRegistry> {
    let registry = WorkflowRegistry::new();

    if !dir.exists() {
        return Ok(registry);
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read workflows directory {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "toml"))
        .collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let expected_name = path.file_stem().and_then(|s| s.to_str());
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read workflow file {}", path.display()))?;

        let definition = parse_workflow_toml(&contents, expected_name)
            .with_context(|| format!("invalid workflow definition in {}", path.display()))?;

        registry
            .register(definition)
            .with_context(|| format!("failed to register workflow from {}", path.display()))?;
    }

    Ok(registry)
}

/// Run the `taskforge worker run` command until shutdown.
///
/// Agents and tools are populated by programmatic registration only
/// (spec.md's Non-goals rule out registry hot-reload; SPEC_FULL.md §12
/// rules out a filesystem auto-discovery plugin system for this version),
/// so both registries start empty here -- concrete agent/tool bodies are
/// out of scope for this crate (spec §1) and are wired in by whatever
/// deployment embeds this worker loop.
pub async fn run_worker(pool: PgPool, config: TaskforgeConfig, workflows_dir: &std::path::Path) -> Result<()> {
    let workflows = load_workflows(workflows_dir)?;
    tracing::info!(
        workflows_dir = %workflows_dir.display(),
        workflows = ?workflows.list(),
        "workflow definitions loaded"
    );

    let agents: Registry<dyn taskforge_core::registry::agent::Agent> = Registry::new();
    let tools: Registry<dyn taskforge_core::registry::tool::Tool> = Registry::new();
    let notifier: Arc<dyn taskforge_core::notifier::Notifier> = Arc::new(NullNotifier);

    // Double-Ctrl-C shutdown: first signal requests a graceful stop
    // (spec §4.5 "SHUTTING_DOWN"), second forces immediate exit. Grounded
    // on the teacher's `dispatch_cmd::run_dispatch` shutdown handler.
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            shutdown_clone.cancel();
        }
    });

    let mut ctx = WorkerContext::new(
        pool,
        Arc::new(SystemClock),
        config.worker_id.clone(),
        config.lease_duration,
        config.recovery_interval,
        config.shutdown_timeout,
        agents,
        tools,
        workflows,
        notifier,
        shutdown,
    );

    println!("taskforge worker starting (worker_id = {})", config.worker_id);
    worker::run(&mut ctx).await?;
    println!("taskforge worker stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_workflows_missing_dir_is_empty() {
        let registry = load_workflows(std::path::Path::new("/nonexistent/taskforge/workflows")).unwrap();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn load_workflows_parses_every_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("research_report.toml"),
            r#"
name = "research_report"
description = "Research then assess."
coordination = "SEQUENTIAL"

[[steps]]
agent_type = "research"
name = "research"

[[steps]]
agent_type = "assessment"
name = "assessment"
"#,
        )
        .unwrap();

        let registry = load_workflows(dir.path()).unwrap();
        assert_eq!(registry.list(), vec!["research_report".to_string()]);
    }

    #[test]
    fn load_workflows_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "not valid toml {{{").unwrap();

        let err = load_workflows(dir.path()).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn load_workflows_ignores_non_toml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "not a workflow").unwrap();

        let registry = load_workflows(dir.path()).unwrap();
        assert!(registry.list().is_empty());
    }
}
