//! Tunables read from `sparkq.toml`. Every field has a default, so an
//! empty or missing file is valid.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub project_name: String,
    /// Timeout for task classes missing from `task_classes`.
    pub default_timeout_secs: u32,
    /// Default timeout per task class.
    pub task_classes: HashMap<String, u32>,
    pub watchdog: WatchdogSettings,
    pub retention: RetentionSettings,
    pub runner: RunnerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogSettings {
    pub interval_secs: u64,
    pub warn_multiplier: f64,
    pub fail_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionSettings {
    pub enabled: bool,
    pub older_than_days: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSettings {
    pub poll_interval_secs: u64,
    pub model: String,
}

impl Default for Settings {
    fn default() -> Self {
        let task_classes = [
            ("FAST_SCRIPT", 120),
            ("MEDIUM_SCRIPT", 600),
            ("LLM_LITE", 300),
            ("LLM_HEAVY", 900),
        ]
        .into_iter()
        .map(|(class, secs)| (class.to_string(), secs))
        .collect();

        Self {
            project_name: "sparkq".to_string(),
            default_timeout_secs: 300,
            task_classes,
            watchdog: WatchdogSettings::default(),
            retention: RetentionSettings::default(),
            runner: RunnerSettings::default(),
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            warn_multiplier: 1.0,
            fail_multiplier: 2.0,
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            older_than_days: 3,
            interval_secs: 3600,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            model: "claude-sonnet-4-20250514".to_string(),
        }
    }
}

impl Settings {
    /// Read and parse a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad settings file {}: {e}", path.display())))
    }

    /// Parse settings from TOML text.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reject values the schedulers cannot work with.
    pub fn validate(&self) -> Result<()> {
        let w = &self.watchdog;
        if w.interval_secs == 0 {
            return Err(Error::Config("watchdog.interval_secs must be positive".into()));
        }
        if !(w.warn_multiplier.is_finite() && w.warn_multiplier > 0.0) {
            return Err(Error::Config("watchdog.warn_multiplier must be positive".into()));
        }
        if !w.fail_multiplier.is_finite() || w.fail_multiplier < w.warn_multiplier {
            return Err(Error::Config(
                "watchdog.fail_multiplier must be at least warn_multiplier".into(),
            ));
        }
        if self.retention.interval_secs == 0 {
            return Err(Error::Config("retention.interval_secs must be positive".into()));
        }
        if self.runner.poll_interval_secs == 0 {
            return Err(Error::Config("runner.poll_interval_secs must be positive".into()));
        }
        if self.default_timeout_secs == 0 {
            return Err(Error::Config("default_timeout_secs must be positive".into()));
        }
        if let Some((class, _)) = self.task_classes.iter().find(|(_, secs)| **secs == 0) {
            return Err(Error::Config(format!("task class {class} has a zero timeout")));
        }
        Ok(())
    }

    /// Timeout for a new task: an explicit value wins, then the class
    /// default, then the global default.
    pub fn timeout_for(&self, task_class: &str, explicit: Option<u32>) -> u32 {
        explicit
            .filter(|secs| *secs > 0)
            .or_else(|| self.task_classes.get(task_class).copied())
            .unwrap_or(self.default_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.runner.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.watchdog.interval_secs, 30);
        assert_eq!(settings.watchdog.warn_multiplier, 1.0);
        assert_eq!(settings.watchdog.fail_multiplier, 2.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let settings = Settings::parse(
            r#"
            default_timeout_secs = 45

            [watchdog]
            interval_secs = 5

            [task_classes]
            BATCH = 3600
            "#,
        )
        .unwrap();
        assert_eq!(settings.watchdog.interval_secs, 5);
        assert_eq!(settings.watchdog.fail_multiplier, 2.0);
        assert_eq!(settings.timeout_for("BATCH", None), 3600);
        assert_eq!(settings.timeout_for("UNKNOWN", None), 45);
        assert_eq!(settings.timeout_for("BATCH", Some(10)), 10);
    }

    #[test]
    fn class_defaults_apply_without_a_file() {
        let settings = Settings::default();
        assert_eq!(settings.timeout_for("LLM_HEAVY", None), 900);
        assert_eq!(settings.timeout_for("FAST_SCRIPT", Some(0)), 120);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Settings::parse("watchdg = 1").is_err());
    }

    #[test]
    fn fail_tier_below_warn_tier_is_invalid() {
        let settings = Settings::parse(
            r#"
            [watchdog]
            warn_multiplier = 3.0
            fail_multiplier = 2.0
            "#,
        )
        .unwrap();
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }
}
