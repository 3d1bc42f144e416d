//! Configuration file management for taskforge.
//!
//! Provides a TOML-based config file at `~/.config/taskforge/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use taskforge_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

/// Recognized worker knobs (spec §6.4), each with the default spec.md
/// states if the key is absent from the file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub lease_duration_secs: i64,
    pub recovery_interval_secs: i64,
    pub poll_min_interval_ms: i64,
    pub poll_max_interval_ms: i64,
    pub max_retries: i32,
    pub shutdown_timeout_secs: i64,
    pub worker_id: Option<String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            lease_duration_secs: 300,
            recovery_interval_secs: 30,
            poll_min_interval_ms: 200,
            poll_max_interval_ms: 10_000,
            max_retries: 3,
            shutdown_timeout_secs: 30,
            worker_id: None,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the taskforge config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/taskforge` or
/// `~/.config/taskforge`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support`
/// on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("taskforge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("taskforge")
}

/// Return the path to the taskforge config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct TaskforgeConfig {
    pub db_config: DbConfig,
    pub lease_duration: Duration,
    pub recovery_interval: Duration,
    pub poll_min_interval: Duration,
    pub poll_max_interval: Duration,
    pub max_retries: i32,
    pub shutdown_timeout: Duration,
    pub worker_id: String,
}

impl TaskforgeConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `TASKFORGE_DATABASE_URL` env >
    ///   `config_file.database.url` > `DbConfig::DEFAULT_URL`.
    /// - Every `[worker]` key: `TASKFORGE_<KEY>` env > config file >
    ///   built-in default (`WorkerSection::default()`).
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("TASKFORGE_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let worker = file_config.map(|c| c.worker).unwrap_or_else(WorkerSection::default);

        let lease_duration_secs = env_i64("TASKFORGE_LEASE_DURATION_SECS")?
            .unwrap_or(worker.lease_duration_secs);
        let recovery_interval_secs = env_i64("TASKFORGE_RECOVERY_INTERVAL_SECS")?
            .unwrap_or(worker.recovery_interval_secs);
        let poll_min_interval_ms =
            env_i64("TASKFORGE_POLL_MIN_INTERVAL_MS")?.unwrap_or(worker.poll_min_interval_ms);
        let poll_max_interval_ms =
            env_i64("TASKFORGE_POLL_MAX_INTERVAL_MS")?.unwrap_or(worker.poll_max_interval_ms);
        let max_retries = env_i64("TASKFORGE_MAX_RETRIES")?
            .map(|v| v as i32)
            .unwrap_or(worker.max_retries);
        let shutdown_timeout_secs = env_i64("TASKFORGE_SHUTDOWN_TIMEOUT_SECS")?
            .unwrap_or(worker.shutdown_timeout_secs);
        let worker_id = std::env::var("TASKFORGE_WORKER_ID")
            .ok()
            .or(worker.worker_id)
            .unwrap_or_else(default_worker_id);

        Ok(Self {
            db_config,
            lease_duration: Duration::seconds(lease_duration_secs),
            recovery_interval: Duration::seconds(recovery_interval_secs),
            poll_min_interval: Duration::milliseconds(poll_min_interval_ms),
            poll_max_interval: Duration::milliseconds(poll_max_interval_ms),
            max_retries,
            shutdown_timeout: Duration::seconds(shutdown_timeout_secs),
            worker_id,
        })
    }
}

fn env_i64(name: &str) -> Result<Option<i64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("{name} is not a valid integer"))
            .map(Some),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {name}")),
    }
}

/// `<hostname>:<pid>`, the default `worker_id` (spec §6.4) when nothing
/// else is configured.
fn default_worker_id() -> String {
    let host = hostname().unwrap_or_else(|| "unknown-host".to_string());
    format!("{host}:{}", std::process::id())
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| {
        let output = std::process::Command::new("hostname").output().ok()?;
        String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
    })
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
