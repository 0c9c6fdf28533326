//! Stale-task watchdog.
//!
//! Two tiers per scan. A running task past `timeout × warn_multiplier` is
//! flagged once with `stale_warned_at`. Past `timeout × fail_multiplier` it
//! is auto-failed with the `TIMEOUT` error type. Auto-fail only applies to
//! tasks still running, so a result that lands first always wins.

use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::ticker::{Periodic, Shutdown};
use crate::config::WatchdogSettings;
use crate::db::Db;
use crate::error::Result;
use crate::model::Task;
use crate::telemetry::metrics;

/// Tuning for a watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub warn_multiplier: f64,
    pub fail_multiplier: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self::from(&WatchdogSettings::default())
    }
}

impl From<&WatchdogSettings> for WatchdogConfig {
    fn from(s: &WatchdogSettings) -> Self {
        Self {
            interval: Duration::from_secs(s.interval_secs),
            warn_multiplier: s.warn_multiplier,
            fail_multiplier: s.fail_multiplier,
        }
    }
}

/// What one scan did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub warned: usize,
    pub auto_failed: usize,
}

#[derive(Clone)]
pub struct Watchdog {
    db: Db,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(db: Db, config: WatchdogConfig) -> Self {
        Self { db, config }
    }

    /// Check every running task once.
    pub async fn scan_once(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        for task in self.db.get_stale_tasks(self.config.warn_multiplier).await? {
            if task.stale_warned_at.is_some() {
                continue;
            }
            if self.db.mark_stale_warned(task.id).await? {
                report.warned += 1;
                metrics::watchdog_actions().add(1, &[KeyValue::new("action", "warned")]);
                warn!(
                    task_id = %task.id,
                    tool = %task.tool_name,
                    timeout_secs = task.timeout,
                    running_secs = running_secs(&task),
                    "task running past its timeout"
                );
            }
        }

        for task in self.db.get_stale_tasks(self.config.fail_multiplier).await? {
            let message = format!(
                "Task exceeded {}s timeout ({}s running, limit {:.0}s)",
                task.timeout,
                running_secs(&task),
                f64::from(task.timeout) * self.config.fail_multiplier,
            );
            if self.db.auto_fail_task(task.id, &message).await? {
                report.auto_failed += 1;
                metrics::watchdog_actions().add(1, &[KeyValue::new("action", "auto_failed")]);
                warn!(task_id = %task.id, tool = %task.tool_name, "task auto-failed: {message}");
            } else {
                debug!(task_id = %task.id, "task finished before auto-fail");
            }
        }

        Ok(report)
    }

    /// Scan on the configured interval until shutdown.
    pub async fn run(self, shutdown: Shutdown) {
        let periodic = Periodic::new("watchdog", self.config.interval);
        periodic
            .run(shutdown, move || {
                let watchdog = self.clone();
                async move { watchdog.scan_once().await.map(|_| ()) }
            })
            .await;
    }
}

fn running_secs(task: &Task) -> i64 {
    task.claimed_at
        .map(|claimed| (Utc::now() - claimed).num_seconds())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::stamp;
    use crate::model::{AUTO_FAIL_ERROR_TYPE, NewTask, TaskId, TaskStatus};

    async fn running_task(db: &Db, timeout: u32, claimed_secs_ago: i64) -> TaskId {
        db.ensure_project("test", None).await.unwrap();
        let session = db.create_session("s", None).await.unwrap();
        let queue = match db.get_queue_by_name("q").await {
            Ok(q) => q,
            Err(_) => db.create_queue(session.id, "q", None).await.unwrap(),
        };
        let task = db
            .create_task(NewTask::new(queue.id, "llm", "LLM_LITE", timeout))
            .await
            .unwrap();
        db.claim_task(task.id).await.unwrap();

        let claimed = stamp(Utc::now() - chrono::Duration::seconds(claimed_secs_ago));
        sqlx::query("UPDATE tasks SET claimed_at = ?1, started_at = ?1 WHERE id = ?2")
            .bind(claimed)
            .bind(task.id.to_string())
            .execute(db.pool())
            .await
            .unwrap();
        task.id
    }

    #[tokio::test]
    async fn warns_once_then_auto_fails() {
        let db = Db::in_memory().await.unwrap();
        let watchdog = Watchdog::new(db.clone(), WatchdogConfig::default());
        let id = running_task(&db, 10, 15).await;

        let first = watchdog.scan_once().await.unwrap();
        assert_eq!(first, ScanReport { warned: 1, auto_failed: 0 });
        let warned_at = db.get_task(id).await.unwrap().stale_warned_at;
        assert!(warned_at.is_some());

        let second = watchdog.scan_once().await.unwrap();
        assert_eq!(second, ScanReport::default());
        assert_eq!(db.get_task(id).await.unwrap().stale_warned_at, warned_at);

        sqlx::query("UPDATE tasks SET claimed_at = ?1 WHERE id = ?2")
            .bind(stamp(Utc::now() - chrono::Duration::seconds(25)))
            .bind(id.to_string())
            .execute(db.pool())
            .await
            .unwrap();

        let third = watchdog.scan_once().await.unwrap();
        assert_eq!(third.auto_failed, 1);

        let task = db.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_type.as_deref(), Some(AUTO_FAIL_ERROR_TYPE));
        assert!(task.error.unwrap().starts_with("TIMEOUT: Task exceeded 10s timeout"));
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn task_far_past_deadline_is_warned_and_failed_in_one_scan() {
        let db = Db::in_memory().await.unwrap();
        let watchdog = Watchdog::new(db.clone(), WatchdogConfig::default());
        let id = running_task(&db, 5, 60).await;

        let report = watchdog.scan_once().await.unwrap();
        assert_eq!(report, ScanReport { warned: 1, auto_failed: 1 });
        assert!(db.get_task(id).await.unwrap().is_auto_failed());
    }

    #[tokio::test]
    async fn fresh_tasks_are_left_alone() {
        let db = Db::in_memory().await.unwrap();
        let watchdog = Watchdog::new(db.clone(), WatchdogConfig::default());
        let id = running_task(&db, 300, 5).await;

        assert_eq!(watchdog.scan_once().await.unwrap(), ScanReport::default());
        let task = db.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.stale_warned_at.is_none());
    }

    #[tokio::test]
    async fn completed_task_is_never_auto_failed() {
        let db = Db::in_memory().await.unwrap();
        let id = running_task(&db, 5, 60).await;
        db.complete_task(id, "done", None).await.unwrap();

        let watchdog = Watchdog::new(db.clone(), WatchdogConfig::default());
        assert_eq!(watchdog.scan_once().await.unwrap(), ScanReport::default());
        assert_eq!(db.get_task(id).await.unwrap().status, TaskStatus::Succeeded);
    }
}
