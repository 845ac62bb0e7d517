//! Configuration.
//!
//! Read from a JSON file given on the command line, else from the
//! `DEMOGRADER_CONFIG` environment variable as JSON, else defaults.
//! `DATABASE_URL` and `MAX_WORKERS` override whatever was loaded. The
//! coordinator hands its resolved config to each worker process through
//! `DEMOGRADER_CONFIG`, so both sides always agree.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::queue::default_max_concurrency;

/// Environment variable carrying the configuration as JSON.
pub const CONFIG_ENV: &str = "DEMOGRADER_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// sqlx connection URL of the Data Store.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Root of the uploaded-file tree.
    #[serde(default = "default_submission_path")]
    pub submission_path: PathBuf,

    /// Maximum concurrent worker processes. Defaults to the core count.
    #[serde(default)]
    pub max_workers: Option<usize>,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Sandbox runner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// User the scripts run as. `null` runs them as the worker itself.
    #[serde(default = "default_run_as")]
    pub run_as: Option<String>,

    /// Bytes kept from each of stdout and stderr.
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,

    /// Parent directory for workspaces. Defaults to the OS temp dir. With
    /// `run_as` set, it and every directory above it must be traversable
    /// by others.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// How long to keep reading output after the script has exited.
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            submission_path: default_submission_path(),
            max_workers: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            run_as: default_run_as(),
            output_limit_bytes: default_output_limit(),
            scratch_dir: None,
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

impl SandboxConfig {
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

impl Config {
    /// Load from `path` if given, else from the environment, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?,
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse `DEMOGRADER_CONFIG`, or fall back to defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => serde_json::from_str(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}")),
            Err(_) => {
                debug!("{CONFIG_ENV} not set, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Apply `DATABASE_URL` and `MAX_WORKERS` as returned by `var`.
    pub fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(workers) = var("MAX_WORKERS") {
            let workers = workers
                .trim()
                .parse()
                .with_context(|| format!("MAX_WORKERS is not a number: {workers:?}"))?;
            self.max_workers = Some(workers);
        }
        Ok(())
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_workers == Some(0) {
            return Err(Error::Config("max_workers must be at least 1".into()));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(Error::Config(
                "sandbox.output_limit_bytes must be at least 1".into(),
            ));
        }
        if let (Some(_), Some(scratch)) = (&self.sandbox.run_as, &self.sandbox.scratch_dir) {
            check_traversable(scratch)?;
        }
        Ok(())
    }

    /// Number of worker processes allowed to run at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_workers.unwrap_or_else(default_max_concurrency)
    }

    /// Serialized form handed to worker processes.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize config")
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

/// The restricted identity enters its workspace through `dir`, so every
/// existing directory on the way down needs the others-execute bit.
fn check_traversable(dir: &Path) -> crate::error::Result<()> {
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    for ancestor in dir.ancestors() {
        let Ok(metadata) = std::fs::metadata(ancestor) else {
            continue;
        };
        let mode = metadata.permissions().mode();
        if mode & 0o001 == 0 {
            return Err(Error::Config(format!(
                "sandbox.scratch_dir {} is not reachable by the sandbox user: {} has mode {:o}",
                dir.display(),
                ancestor.display(),
                mode & 0o7777
            )));
        }
    }
    Ok(())
}

fn default_database_url() -> String {
    "sqlite://demograder.sqlite".into()
}

fn default_submission_path() -> PathBuf {
    "submissions".into()
}

#[allow(clippy::unnecessary_wraps)]
fn default_run_as() -> Option<String> {
    Some("nobody".into())
}

const fn default_output_limit() -> usize {
    64 * 1024
}

const fn default_drain_grace_ms() -> u64 {
    500
}
