//! Task record, lifecycle status and the builder used to enqueue work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{QueueId, TaskId};
use crate::error::{Error, Result};

/// Error type stamped on tasks the watchdog failed for running too long.
/// Only failures carrying this marker can be rescued.
pub const AUTO_FAIL_ERROR_TYPE: &str = "TIMEOUT";

/// Error type recorded when the runner's execution step fails.
pub const EXECUTION_ERROR_TYPE: &str = "EXECUTION_ERROR";

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked through queued → running → succeeded | failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue_id: QueueId,

    /// Tool the invoker should use (e.g. "llm-haiku", "run-script").
    pub tool_name: String,

    /// Coarse class used to pick a default timeout.
    pub task_class: String,

    /// Opaque work description. Usually JSON, but runners must tolerate
    /// any text.
    pub payload: String,

    pub status: TaskStatus,

    /// Seconds the task may run before the watchdog considers it stale.
    pub timeout: u32,

    /// Successful claims so far.
    pub attempts: u32,

    pub result: Option<serde_json::Value>,
    pub result_summary: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,

    /// The task this one was cloned from by a requeue.
    pub requeued_from: Option<TaskId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stale_warned_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Payload parsed as JSON, if it is JSON.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.payload).ok()
    }

    /// Was this task failed by the watchdog rather than by its executor?
    pub fn is_auto_failed(&self) -> bool {
        self.status == TaskStatus::Failed
            && self.error_type.as_deref() == Some(AUTO_FAIL_ERROR_TYPE)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a runner.
    Queued,
    /// Claimed by a runner.
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::Validation(format!("unknown task status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueueing a task.
pub struct NewTask {
    pub(crate) queue_id: QueueId,
    pub(crate) tool_name: String,
    pub(crate) task_class: String,
    pub(crate) payload: String,
    pub(crate) timeout: u32,
}

impl NewTask {
    pub fn new(
        queue_id: QueueId,
        tool_name: impl Into<String>,
        task_class: impl Into<String>,
        timeout: u32,
    ) -> Self {
        Self {
            queue_id,
            tool_name: tool_name.into(),
            task_class: task_class.into(),
            payload: "{}".to_string(),
            timeout,
        }
    }

    /// Structured payload, stored as JSON text.
    pub fn payload(mut self, payload: &serde_json::Value) -> Self {
        self.payload = payload.to_string();
        self
    }

    /// Payload stored verbatim, whatever its shape.
    pub fn raw_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.tool_name.trim().is_empty() {
            return Err(Error::Validation("tool_name must not be empty".into()));
        }
        if self.task_class.trim().is_empty() {
            return Err(Error::Validation("task_class must not be empty".into()));
        }
        if self.timeout == 0 {
            return Err(Error::Validation("timeout must be at least 1 second".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filter for listing tasks. Status comes in as text from the outer layers
/// and is validated by the store.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub queue_id: Option<QueueId>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

/// Per-status task counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.queued + self.running + self.succeeded + self.failed
    }
}

/// Format an error message, prefixing the error type when one is given.
pub fn format_error(message: &str, error_type: Option<&str>) -> String {
    match error_type {
        Some(kind) if !kind.trim().is_empty() => format!("{kind}: {message}"),
        _ => message.to_string(),
    }
}
