//! Per-queue runner: poll, claim, invoke, report.
//!
//! A runner owns one queue and executes one task at a time, oldest first.
//! Execution failures are recorded on the task and never end the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde_json::{Value, json};
use tracing::{Instrument, debug, error, info, warn};

use super::ticker::Shutdown;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::invoker::Invoker;
use crate::model::{EXECUTION_ERROR_TYPE, Lifecycle, Queue, Task, TaskId, TaskStatus};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_outcome, record_state_transition, start_task_span};

/// Summary used when a response has no usable first line.
pub const DEFAULT_SUMMARY: &str = "Task completed";

const SUMMARY_MAX_CHARS: usize = 200;

/// Payload keys checked, in order, for the prompt text.
const PROMPT_FIELDS: &[&str] = &["prompt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Execute at most one task.
    Once,
    /// Execute until the queue has nothing queued.
    Drain,
    /// Poll forever until shutdown.
    Watch,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub mode: RunMode,
    /// Sleep between polls of an empty queue in watch mode.
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Watch,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Tasks finished by one `run`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: u32,
    pub failed: u32,
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing queued.
    Idle,
    /// Another runner claimed the head first.
    Contended,
    Succeeded(TaskId),
    Failed(TaskId),
}

pub struct Runner {
    db: Db,
    invoker: Arc<dyn Invoker>,
    queue: Queue,
    config: RunnerConfig,
    shutdown: Shutdown,
}

impl Runner {
    /// Build a runner for the queue named or identified by `queue_ref`.
    pub async fn for_queue(
        db: Db,
        invoker: Arc<dyn Invoker>,
        queue_ref: &str,
        config: RunnerConfig,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let queue = db.resolve_queue(queue_ref).await?;
        if queue.status != Lifecycle::Active {
            warn!(queue = %queue.name, "queue has ended; running it anyway");
        }
        Ok(Self {
            db,
            invoker,
            queue,
            config,
            shutdown,
        })
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Run in the configured mode.
    ///
    /// In watch mode store errors are logged and retried after the poll
    /// interval; in the other modes they end the run.
    pub async fn run(&self) -> Result<RunSummary> {
        info!(
            queue = %self.queue.name,
            mode = ?self.config.mode,
            invoker = self.invoker.name(),
            "runner started"
        );
        let mut summary = RunSummary::default();

        while !self.shutdown.is_triggered() {
            let step = match self.step().await {
                Ok(step) => step,
                Err(e) if self.config.mode == RunMode::Watch => {
                    error!(queue = %self.queue.name, "poll failed: {e}");
                    self.idle().await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match step {
                Step::Contended => continue,
                Step::Idle => match self.config.mode {
                    RunMode::Once | RunMode::Drain => break,
                    RunMode::Watch => self.idle().await,
                },
                Step::Succeeded(_) => summary.succeeded += 1,
                Step::Failed(_) => summary.failed += 1,
            }

            if self.config.mode == RunMode::Once && matches!(step, Step::Succeeded(_) | Step::Failed(_))
            {
                break;
            }
        }

        info!(
            queue = %self.queue.name,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "runner finished"
        );
        Ok(summary)
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// Claim and execute the oldest queued task, if any.
    pub async fn step(&self) -> Result<Step> {
        let Some(head) = self.db.get_oldest_queued_task(self.queue.id).await? else {
            return Ok(Step::Idle);
        };

        let task = match self.db.claim_task(head.id).await {
            Ok(task) => task,
            Err(e) if e.is_conflict() => {
                debug!(task_id = %head.id, "lost claim race");
                return Ok(Step::Contended);
            }
            Err(e) => return Err(e),
        };

        let span = start_task_span(&self.queue.name, &task.tool_name, &task.id);
        record_state_transition(&span, "queued", "running");
        let step = self.execute(&task).instrument(span.clone()).await;

        match step {
            Step::Succeeded(_) => {
                record_state_transition(&span, "running", "succeeded");
                record_outcome(&span, "succeeded");
            }
            _ => {
                record_state_transition(&span, "running", "failed");
                record_outcome(&span, "failed");
            }
        }
        Ok(step)
    }

    async fn execute(&self, task: &Task) -> Step {
        let (summary, data) = match self.invoke(task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(task.id, &e).await;
                return Step::Failed(task.id);
            }
        };

        match self.complete(task.id, &summary, &data).await {
            Ok(()) => {
                info!(task_id = %task.id, attempts = task.attempts, "task succeeded");
                Step::Succeeded(task.id)
            }
            Err(e) if e.is_conflict() => {
                // Finished by someone else; their outcome stands.
                warn!(task_id = %task.id, "result dropped: {e}");
                Step::Failed(task.id)
            }
            Err(e) => {
                self.record_failure(task.id, &e).await;
                Step::Failed(task.id)
            }
        }
    }

    async fn invoke(&self, task: &Task) -> Result<(String, Value)> {
        let prompt = extract_prompt(&task.payload);
        let timeout = Duration::from_secs(u64::from(task.timeout));

        let started = Instant::now();
        let invocation = self.invoker.invoke(&prompt, timeout).await;
        let outcome = if invocation.error.is_none() && invocation.response.is_some() {
            "ok"
        } else {
            "error"
        };
        metrics::invoke_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("tool", task.tool_name.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );

        if let Some(err) = invocation.error {
            return Err(Error::Other(err));
        }
        let response = invocation
            .response
            .ok_or_else(|| Error::Other("invoker returned no response".into()))?;

        let summary = summarize(&response);
        let data = json!({
            "response": response,
            "usage": invocation.usage,
        });
        Ok((summary, data))
    }

    /// Complete, rescuing a task the watchdog auto-failed while it ran.
    async fn complete(&self, id: TaskId, summary: &str, data: &Value) -> Result<()> {
        match self.db.complete_task(id, summary, Some(data)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                let current = self.db.get_task(id).await?;
                if !current.is_auto_failed() {
                    return Err(e);
                }
                warn!(task_id = %id, "late result for auto-failed task, rescuing");
                self.db.reset_auto_failed_task(id, TaskStatus::Running).await?;
                self.db.complete_task(id, summary, Some(data)).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn record_failure(&self, id: TaskId, err: &Error) {
        warn!(task_id = %id, "task failed: {err}");
        if let Err(e) = self
            .db
            .fail_task(id, &err.to_string(), Some(EXECUTION_ERROR_TYPE))
            .await
        {
            error!(task_id = %id, "could not record task failure: {e}");
        }
    }
}

/// Prompt text for a payload: a `prompt` string field of a JSON object, a
/// bare JSON string, or else the raw payload.
pub fn extract_prompt(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => PROMPT_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str))
            .map_or_else(|| payload.to_string(), str::to_string),
        Ok(Value::String(text)) => text,
        _ => payload.to_string(),
    }
}

/// First non-blank line of `response`, trimmed and capped.
pub fn summarize(response: &str) -> String {
    match response.lines().map(str::trim).find(|line| !line.is_empty()) {
        Some(line) if line.chars().count() > SUMMARY_MAX_CHARS => {
            let cut: String = line.chars().take(SUMMARY_MAX_CHARS - 3).collect();
            format!("{cut}...")
        }
        Some(line) => line.to_string(),
        None => DEFAULT_SUMMARY.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_comes_from_field_string_or_raw_text() {
        assert_eq!(extract_prompt(r#"{"prompt": "hi", "x": 1}"#), "hi");
        assert_eq!(extract_prompt(r#""just text""#), "just text");
        assert_eq!(extract_prompt("not json {"), "not json {");
        assert_eq!(extract_prompt(r#"{"prompt": 42}"#), r#"{"prompt": 42}"#);
        assert_eq!(extract_prompt(r#"{"other": "x"}"#), r#"{"other": "x"}"#);
        assert_eq!(extract_prompt("[1, 2]"), "[1, 2]");
    }

    #[test]
    fn summary_is_first_nonblank_line() {
        assert_eq!(summarize("\n\n  Done: 3 files  \nmore"), "Done: 3 files");
        assert_eq!(summarize("   \n\t"), DEFAULT_SUMMARY);
        assert_eq!(summarize(""), DEFAULT_SUMMARY);
    }

    #[test]
    fn long_summaries_are_capped_on_char_boundaries() {
        let line = "é".repeat(500);
        let summary = summarize(&line);
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS);
        assert!(summary.ends_with("..."));
    }
}
