//! Scheduling and execution substrate for the task orchestration platform.
//!
//! This crate owns everything that touches the task/subtask state machines:
//! claiming, lease recovery, per-work-item execution, the worker main loop,
//! the agent/tool/workflow registries, and declarative workflow execution.
//! It depends on `taskforge-db` for storage and has no knowledge of the
//! HTTP/WS surface in front of it.

pub mod audit;
pub mod backoff;
pub mod clock;
pub mod lease;
pub mod notifier;
pub mod orchestrator;
pub mod registry;
pub mod state;
pub mod task_machine;
pub mod worker;
pub mod workflow;
