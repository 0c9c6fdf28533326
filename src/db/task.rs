//! Task lifecycle operations: enqueue, claim, complete, fail, requeue,
//! rescue, stale scan and retention purge.
//!
//! Every transition is one conditional UPDATE whose affected-row count
//! decides success. SQLite serializes writers across processes, so the
//! count is a compare-and-swap that holds between separate runners, not
//! just between tasks of one process.

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info};

use super::stamp;
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;

const TASK_COLUMNS: &str = "id, queue_id, tool_name, task_class, payload, status, timeout, attempts,
     result, result_summary, error, error_type, stdout, stderr, requeued_from,
     created_at, updated_at, started_at, claimed_at, finished_at, stale_warned_at";

fn count_transition(from: &'static str, to: TaskStatus) {
    metrics::task_state_transitions().add(
        1,
        &[KeyValue::new("from", from), KeyValue::new("to", to.as_str())],
    );
}

impl super::Db {
    /// Enqueue a task. It starts queued with zero attempts.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        new.validate()?;
        let queue = self.get_queue(new.queue_id).await?;
        let task = self.insert_task(&new, None).await?;

        metrics::tasks_created().add(1, &[KeyValue::new("queue", queue.name.clone())]);
        info!(
            task_id = %task.id,
            queue = %queue.name,
            tool = %task.tool_name,
            class = %task.task_class,
            "task enqueued"
        );
        Ok(task)
    }

    async fn insert_task(&self, new: &NewTask, requeued_from: Option<TaskId>) -> Result<Task> {
        let id = TaskId::new();
        let now = stamp(Utc::now());
        sqlx::query(
            "INSERT INTO tasks (id, queue_id, tool_name, task_class, payload, status, timeout, attempts, requeued_from, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, 0, ?7, ?8, ?8)",
        )
        .bind(id.to_string())
        .bind(new.queue_id.to_string())
        .bind(&new.tool_name)
        .bind(&new.task_class)
        .bind(&new.payload)
        .bind(i64::from(new.timeout))
        .bind(requeued_from.map(|t| t.to_string()))
        .bind(&now)
        .execute(self.pool())
        .await?;

        self.get_task(id).await
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
                .bind(id.to_string())
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    /// List tasks, oldest first. An unknown status filter is a validation
    /// error, not an empty result.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let status = filter
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()?;

        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR queue_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?3"
        ))
        .bind(filter.queue_id.map(|q| q.to_string()))
        .bind(status.map(TaskStatus::as_str))
        .bind(filter.limit.map_or(-1, i64::from))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    /// The queued task that was created first in this queue.
    ///
    /// Insertion order (rowid) breaks ties between identical timestamps.
    pub async fn get_oldest_queued_task(&self, queue_id: QueueId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE queue_id = ?1 AND status = 'queued'
             ORDER BY created_at ASC, rowid ASC
             LIMIT 1"
        ))
        .bind(queue_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    /// Claim a queued task: queued → running, attempts + 1.
    ///
    /// Exactly one of any number of concurrent claimants wins; the others
    /// get [`Error::Conflict`].
    pub async fn claim_task(&self, id: TaskId) -> Result<Task> {
        let now = stamp(Utc::now());
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = ?1, claimed_at = ?1, updated_at = ?1,
                 attempts = attempts + 1, stale_warned_at = NULL
             WHERE id = ?2 AND status = 'queued'",
        )
        .bind(&now)
        .bind(id.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let current = self.get_task(id).await?;
            metrics::claim_conflicts().add(1, &[]);
            return Err(Error::Conflict(format!(
                "task {id} is {}, not queued",
                current.status
            )));
        }

        count_transition("queued", TaskStatus::Running);
        debug!(task_id = %id, "task claimed");
        self.get_task(id).await
    }

    /// Record success for a running task.
    ///
    /// `summary` must carry text; callers substitute their own default
    /// before calling.
    pub async fn complete_task(
        &self,
        id: TaskId,
        summary: &str,
        data: Option<&serde_json::Value>,
    ) -> Result<Task> {
        if summary.trim().is_empty() {
            return Err(Error::Validation("completion summary must not be empty".into()));
        }

        let now = stamp(Utc::now());
        let result = data.map(serde_json::to_string).transpose()?;
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = 'succeeded', result = ?1, result_summary = ?2,
                 error = NULL, error_type = NULL, finished_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = 'running'",
        )
        .bind(result)
        .bind(summary)
        .bind(&now)
        .bind(id.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let current = self.get_task(id).await?;
            return Err(Error::Conflict(format!(
                "task {id} is {}, not running",
                current.status
            )));
        }

        count_transition("running", TaskStatus::Succeeded);
        self.get_task(id).await
    }

    /// Fail a task from whatever status it is in.
    ///
    /// This is the operator/system override: it is not restricted to
    /// running tasks.
    pub async fn fail_task(
        &self,
        id: TaskId,
        message: &str,
        error_type: Option<&str>,
    ) -> Result<Task> {
        let now = stamp(Utc::now());
        let error_type = error_type.map(str::trim).filter(|t| !t.is_empty());
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = 'failed', error = ?1, error_type = ?2, result = NULL,
                 result_summary = NULL, finished_at = ?3, updated_at = ?3
             WHERE id = ?4",
        )
        .bind(format_error(message, error_type))
        .bind(error_type)
        .bind(&now)
        .bind(id.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("task {id}")));
        }

        count_transition("any", TaskStatus::Failed);
        self.get_task(id).await
    }

    /// Watchdog failure. Only applies while the task is still running, so a
    /// task that finished between the scan and this call keeps its outcome.
    ///
    /// Returns `false` when the task was no longer running.
    pub async fn auto_fail_task(&self, id: TaskId, message: &str) -> Result<bool> {
        let now = stamp(Utc::now());
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = 'failed', error = ?1, error_type = ?2,
                 finished_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = 'running'",
        )
        .bind(format_error(message, Some(AUTO_FAIL_ERROR_TYPE)))
        .bind(AUTO_FAIL_ERROR_TYPE)
        .bind(&now)
        .bind(id.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 1 {
            count_transition("running", TaskStatus::Failed);
        }
        Ok(rows_affected == 1)
    }

    /// Clone a finished task into a fresh queued task.
    ///
    /// The source row is never modified; the clone points back at it
    /// through `requeued_from`.
    pub async fn requeue_task(&self, id: TaskId) -> Result<Task> {
        let source = self.get_task(id).await?;
        if !source.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "task {id} is {}; only finished tasks can be requeued",
                source.status
            )));
        }

        let new = NewTask {
            queue_id: source.queue_id,
            tool_name: source.tool_name,
            task_class: source.task_class,
            payload: source.payload,
            timeout: source.timeout,
        };
        let task = self.insert_task(&new, Some(id)).await?;

        info!(task_id = %task.id, requeued_from = %id, "task requeued");
        Ok(task)
    }

    /// Rescue a task the watchdog auto-failed, moving it to `target`
    /// (running or queued) and clearing the failure.
    ///
    /// A late result from an executor that raced the watchdog can then be
    /// recorded with [`complete_task`](Self::complete_task).
    pub async fn reset_auto_failed_task(&self, id: TaskId, target: TaskStatus) -> Result<Task> {
        if !matches!(target, TaskStatus::Running | TaskStatus::Queued) {
            return Err(Error::Validation(format!(
                "auto-failed tasks can only be reset to running or queued, not {target}"
            )));
        }

        let now = stamp(Utc::now());
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = ?1, error = NULL, error_type = NULL, finished_at = NULL,
                 stale_warned_at = NULL, updated_at = ?2
             WHERE id = ?3 AND status = 'failed' AND error_type = ?4",
        )
        .bind(target.as_str())
        .bind(&now)
        .bind(id.to_string())
        .bind(AUTO_FAIL_ERROR_TYPE)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let current = self.get_task(id).await?;
            return Err(Error::Conflict(format!(
                "task {id} ({}) was not auto-failed by the watchdog",
                current.status
            )));
        }

        count_transition("failed", target);
        info!(task_id = %id, to = %target, "auto-failed task reset");
        self.get_task(id).await
    }

    /// Running tasks whose time since claim exceeds `timeout × multiplier`.
    pub async fn get_stale_tasks(&self, timeout_multiplier: f64) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'running' AND claimed_at IS NOT NULL
             ORDER BY claimed_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        let now = Utc::now();
        let mut stale = Vec::new();
        for row in rows {
            let task = row.try_into_task()?;
            if is_stale(&task, now, timeout_multiplier) {
                stale.push(task);
            }
        }
        Ok(stale)
    }

    /// Stamp `stale_warned_at` on a running task the first time it is
    /// seen stale. Returns whether this call set it.
    pub async fn mark_stale_warned(&self, id: TaskId) -> Result<bool> {
        let now = stamp(Utc::now());
        let rows_affected = sqlx::query(
            "UPDATE tasks SET stale_warned_at = ?1
             WHERE id = ?2 AND status = 'running' AND stale_warned_at IS NULL",
        )
        .bind(&now)
        .bind(id.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    /// Attach captured process output to a task.
    pub async fn set_task_output(
        &self,
        id: TaskId,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<Task> {
        let now = stamp(Utc::now());
        let rows_affected = sqlx::query(
            "UPDATE tasks SET stdout = COALESCE(?1, stdout), stderr = COALESCE(?2, stderr), updated_at = ?3
             WHERE id = ?4",
        )
        .bind(stdout)
        .bind(stderr)
        .bind(&now)
        .bind(id.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("task {id}")));
        }
        self.get_task(id).await
    }

    /// Delete finished tasks older than `older_than_days`. Queued and
    /// running tasks are never touched. Returns how many rows went.
    pub async fn purge_old_tasks(&self, older_than_days: u32) -> Result<u64> {
        // A window reaching past the earliest representable time covers no task.
        let Some(cutoff) = TimeDelta::try_days(i64::from(older_than_days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            debug!(older_than_days, "retention window out of range, nothing to purge");
            return Ok(0);
        };
        let cutoff = stamp(cutoff);
        let deleted = sqlx::query(
            "DELETE FROM tasks
             WHERE status IN ('succeeded', 'failed') AND finished_at IS NOT NULL AND finished_at < ?1",
        )
        .bind(&cutoff)
        .execute(self.pool())
        .await?
        .rows_affected();

        if deleted > 0 {
            metrics::tasks_purged().add(deleted, &[]);
            info!(deleted, older_than_days, "purged finished tasks");
        }
        Ok(deleted)
    }

    /// Task counts per status for a queue.
    pub async fn queue_stats(&self, queue_id: QueueId) -> Result<QueueStats> {
        self.get_queue(queue_id).await?;

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tasks WHERE queue_id = ?1 GROUP BY status",
        )
        .bind(queue_id.to_string())
        .fetch_all(self.pool())
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse::<TaskStatus>()? {
                TaskStatus::Queued => stats.queued = count,
                TaskStatus::Running => stats.running = count,
                TaskStatus::Succeeded => stats.succeeded = count,
                TaskStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

/// Has a running task been claimed for longer than `timeout × multiplier`?
pub(crate) fn is_stale(task: &Task, now: DateTime<Utc>, multiplier: f64) -> bool {
    let Some(claimed_at) = task.claimed_at else {
        return false;
    };
    if task.status != TaskStatus::Running {
        return false;
    }
    let allowed_ms = (f64::from(task.timeout) * multiplier * 1000.0) as i64;
    (now - claimed_at).num_milliseconds() > allowed_ms
}

// ---------------------------------------------------------------------------
// Row type
// ---------------------------------------------------------------------------

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    queue_id: String,
    tool_name: String,
    task_class: String,
    payload: String,
    status: String,
    timeout: i64,
    attempts: i64,
    result: Option<String>,
    result_summary: Option<String>,
    error: Option<String>,
    error_type: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    requeued_from: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stale_warned_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        let result = self
            .result
            .map(|r| serde_json::from_str(&r))
            .transpose()?;

        Ok(Task {
            id: self.id.parse()?,
            queue_id: self.queue_id.parse()?,
            tool_name: self.tool_name,
            task_class: self.task_class,
            payload: self.payload,
            status: self.status.parse()?,
            timeout: u32::try_from(self.timeout)
                .map_err(|_| Error::Other(format!("task timeout out of range: {}", self.timeout)))?,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| Error::Other(format!("task attempts out of range: {}", self.attempts)))?,
            result,
            result_summary: self.result_summary,
            error: self.error,
            error_type: self.error_type,
            stdout: self.stdout,
            stderr: self.stderr,
            requeued_from: self.requeued_from.map(|r| r.parse()).transpose()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            claimed_at: self.claimed_at,
            finished_at: self.finished_at,
            stale_warned_at: self.stale_warned_at,
        })
    }
}
