//! The model/tool invoker a runner hands each claimed task to.
//!
//! The runner treats the invoker as opaque: it passes a prompt and the
//! task's timeout and gets back either a response or an error.

pub mod anthropic;

pub use anthropic::AnthropicInvoker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// What an invocation produced. `response` and `error` are exclusive in
/// well-behaved invokers; a missing response counts as an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Invocation {
    pub response: Option<String>,
    pub error: Option<String>,
    /// Provider-specific accounting (tokens, cost). Opaque to the engine.
    pub usage: Option<serde_json::Value>,
}

impl Invocation {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: serde_json::Value) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[async_trait]
pub trait Invoker: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &str;

    /// Execute `prompt`, giving up after `timeout`.
    async fn invoke(&self, prompt: &str, timeout: Duration) -> Invocation;
}

/// Prompts a [`DryRunInvoker`] keeps; older ones are dropped.
pub const DRY_RUN_HISTORY: usize = 100;

/// Echoes prompts instead of executing them, remembering the most recent
/// [`DRY_RUN_HISTORY`] of them.
#[derive(Debug, Default)]
pub struct DryRunInvoker {
    seen: Mutex<DryRunLog>,
}

#[derive(Debug, Default)]
struct DryRunLog {
    recent: VecDeque<String>,
    total: u64,
}

impl DryRunLog {
    fn record(&mut self, prompt: &str) {
        if self.recent.len() == DRY_RUN_HISTORY {
            self.recent.pop_front();
        }
        self.recent.push_back(prompt.to_string());
        self.total += 1;
    }
}

impl DryRunInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut DryRunLog) -> T) -> T {
        match self.seen.lock() {
            Ok(mut log) => f(&mut log),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Most recent prompts, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.with_log(|log| log.recent.iter().cloned().collect())
    }

    /// Number of invocations since creation, including forgotten prompts.
    pub fn invocations(&self) -> u64 {
        self.with_log(|log| log.total)
    }
}

#[async_trait]
impl Invoker for DryRunInvoker {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn invoke(&self, prompt: &str, timeout: Duration) -> Invocation {
        info!(
            timeout_secs = timeout.as_secs(),
            prompt_chars = prompt.chars().count(),
            "dry-run invocation"
        );
        self.with_log(|log| log.record(prompt));
        Invocation::ok(format!("[dry-run] {prompt}"))
    }
}
