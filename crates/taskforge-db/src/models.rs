use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task or subtask row (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

impl TaskStatus {
    /// `true` for `DONE`/`ERROR`, the only terminal values for this status field.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Coordination mode of a declarative workflow (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCoordination {
    Sequential,
    IterativeRefinement,
}

impl fmt::Display for WorkflowCoordination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::IterativeRefinement => "iterative_refinement",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowCoordination {
    type Err = WorkflowCoordinationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "iterative_refinement" => Ok(Self::IterativeRefinement),
            other => Err(WorkflowCoordinationParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowCoordination`] string.
#[derive(Debug, Clone)]
pub struct WorkflowCoordinationParseError(pub String);

impl fmt::Display for WorkflowCoordinationParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow coordination mode: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowCoordinationParseError {}

// ---------------------------------------------------------------------------

/// Kind of audit event (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    TaskSubmitted,
    TaskClaimed,
    LeaseRecovered,
    TaskDone,
    TaskError,
    WorkflowStarted,
    SubtaskDone,
    WorkflowConverged,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskSubmitted => "task_submitted",
            Self::TaskClaimed => "task_claimed",
            Self::LeaseRecovered => "lease_recovered",
            Self::TaskDone => "task_done",
            Self::TaskError => "task_error",
            Self::WorkflowStarted => "workflow_started",
            Self::SubtaskDone => "subtask_done",
            Self::WorkflowConverged => "workflow_converged",
        };
        f.write_str(s)
    }
}

impl FromStr for AuditEventKind {
    type Err = AuditEventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_submitted" => Ok(Self::TaskSubmitted),
            "task_claimed" => Ok(Self::TaskClaimed),
            "lease_recovered" => Ok(Self::LeaseRecovered),
            "task_done" => Ok(Self::TaskDone),
            "task_error" => Ok(Self::TaskError),
            "workflow_started" => Ok(Self::WorkflowStarted),
            "subtask_done" => Ok(Self::SubtaskDone),
            "workflow_converged" => Ok(Self::WorkflowConverged),
            other => Err(AuditEventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AuditEventKind`] string.
#[derive(Debug, Clone)]
pub struct AuditEventKindParseError(pub String);

impl fmt::Display for AuditEventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid audit event kind: {:?}", self.0)
    }
}

impl std::error::Error for AuditEventKindParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A primary work item submitted by clients (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub kind: String,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub user_hash: Option<String>,
    pub tenant: Option<String>,
    pub model_used: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_cost: Decimal,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lease_timeout: Option<DateTime<Utc>>,
    pub try_count: i32,
    pub max_tries: i32,
}

/// A child work item generated by the orchestrator (spec §3.2).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subtask {
    pub id: Uuid,
    pub parent_id: Uuid,
    pub agent_type: String,
    pub iteration: i32,
    pub step_name: Option<String>,
    pub kind: String,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub user_hash: Option<String>,
    pub tenant: Option<String>,
    pub model_used: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_cost: Decimal,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lease_timeout: Option<DateTime<Utc>>,
    pub try_count: i32,
    pub max_tries: i32,
}

/// One row per workflow-kind [`Task`] (spec §3.3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowState {
    pub parent_id: Uuid,
    pub workflow_name: String,
    pub current_step: i32,
    pub current_iteration: i32,
    pub max_iterations: i32,
    pub converged: bool,
    pub accumulated: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// An append-only audit log entry (spec §3.4).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub event_kind: AuditEventKind,
    pub resource_id: Uuid,
    pub user_hash: Option<String>,
    pub tenant: Option<String>,
    pub at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
