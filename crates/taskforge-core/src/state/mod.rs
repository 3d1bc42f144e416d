//! Task status state machine transitions (spec §4.3).
//!
//! Validates and executes status transitions for task and subtask rows,
//! enforcing the allowed transition graph and optimistic locking. Claim and
//! recovery transitions are performed by [`crate::lease::LeaseManager`]
//! directly, since they also touch lease/retry bookkeeping that this module
//! does not own; this module is the authority on *which* transitions are
//! legal and is used by [`crate::task_machine`] to report terminal outcomes.

use anyhow::{Result, bail};
use taskforge_db::models::TaskStatus;

/// The task status state machine.
///
/// Enforces the valid transition graph (spec §4.3):
///
/// ```text
/// PENDING -> RUNNING   (claim succeeds)
/// RUNNING -> PENDING   (lease expired; recovery sweep)
/// RUNNING -> DONE       (work produced output)
/// RUNNING -> ERROR      (work raised, or retries exhausted)
/// PENDING -> ERROR      (retry cap reached at claim time)
/// ```
///
/// `DONE` and `ERROR` are terminal: no further transitions are accepted.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Pending)
                | (TaskStatus::Running, TaskStatus::Done)
                | (TaskStatus::Running, TaskStatus::Error)
                | (TaskStatus::Pending, TaskStatus::Error)
        )
    }

    /// Validate a transition request, raising an `InvalidTransition`-class
    /// error (spec §7) for anything not in the graph above. Terminal
    /// statuses (`DONE`, `ERROR`) never appear as a valid `from` here.
    pub fn validate(from: TaskStatus, to: TaskStatus) -> Result<()> {
        if from.is_terminal() {
            bail!("invalid state transition: {from} is terminal, cannot move to {to}");
        }
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to}");
        }
        Ok(())
    }
}
