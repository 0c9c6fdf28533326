//! Typed configuration from environment variables and an optional TOML
//! settings file.
//!
//! Loads once at startup and fails fast on bad values. The API key is
//! wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;
pub mod settings;

pub use settings::{RetentionSettings, RunnerSettings, Settings, WatchdogSettings};

use crate::error::{Error, Result};
use secrets::SecretString;
use std::path::{Path, PathBuf};

/// Settings file picked up from the working directory when `SPARKQ_CONFIG`
/// is unset.
pub const DEFAULT_SETTINGS_FILE: &str = "sparkq.toml";

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub lock_dir: PathBuf,
    pub anthropic_api_key: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub settings: Settings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let settings = match std::env::var("SPARKQ_CONFIG") {
            Ok(path) => Settings::load(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_SETTINGS_FILE).exists() => {
                Settings::load(Path::new(DEFAULT_SETTINGS_FILE))?
            }
            Err(_) => Settings::default(),
        };
        settings.validate()?;

        Ok(Self {
            database_path: PathBuf::from(var_or("SPARKQ_DB", "sparkq.db")?),
            lock_dir: PathBuf::from(var_or("SPARKQ_LOCK_DIR", ".sparkq")?),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            settings,
        })
    }

    /// The API key, or a configuration error naming the missing variable.
    pub fn require_api_key(&self) -> Result<&SecretString> {
        self.anthropic_api_key.as_ref().ok_or_else(|| {
            Error::Config("ANTHROPIC_API_KEY is required for model invocation".to_string())
        })
    }
}

fn var_or(name: &str, default: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Err(Error::Config(format!(
            "environment variable {name} is set but empty"
        ))),
        Ok(value) => Ok(value),
        Err(_) => Ok(default.to_string()),
    }
}
