//! Daemon configuration.
//!
//! Loaded from a YAML file found either at an explicit path or in the
//! standard search locations. Paths and counts the daemon cannot guess are
//! required; tuning knobs carry defaults matching a small local deployment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Search locations for `config.yaml`, in order.
fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.yaml")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/orchestrator/config.yaml"));
    }
    paths.push(PathBuf::from("/etc/orchestrator/config.yaml"));
    paths
}

/// Errors from loading configuration. All of them are fatal to the daemon.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found (searched: {0})")]
    NotFound(String),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Out-of-range or empty value; the message names the field.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    pub scheduler: SchedulerConfig,
    pub ci: CiConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    /// Location of the shared bare repository.
    pub path: PathBuf,
    /// Root directory for worktrees.
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    /// Number of workers.
    #[serde(default = "default_agent_count")]
    pub count: u32,
    /// Advisory per-ticket budget in seconds.
    #[serde(default = "default_agent_timeout")]
    pub timeout: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        AgentsConfig {
            count: default_agent_count(),
            timeout: default_agent_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Watcher ticker period in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Directory watched for inbound tickets.
    pub backlog_path: PathBuf,
    /// Advisory staleness budget in seconds.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CiConfig {
    /// Directory of CI verdict files.
    pub status_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpcConfig {
    /// Event-bus socket path; `~/` is expanded.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        IpcConfig {
            socket_path: default_socket_path(),
        }
    }
}

fn default_agent_count() -> u32 {
    3
}

fn default_agent_timeout() -> u64 {
    1800
}

fn default_poll_interval() -> u64 {
    5
}

fn default_stale_timeout() -> u64 {
    900
}

fn default_socket_path() -> String {
    "~/.orchestrator.sock".to_string()
}

impl Config {
    /// Loads configuration from the given path, or from the first existing
    /// file in the standard search locations.
    pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => search_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| {
                    let searched = search_paths()
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    ConfigError::NotFound(searched)
                })?,
        };

        let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    /// Parses and validates configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "repository.path must not be empty".into(),
            ));
        }
        if self.repository.workdir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "repository.workdir must not be empty".into(),
            ));
        }
        if self.agents.count < 1 {
            return Err(ConfigError::Invalid(
                "agents.count must be at least 1".into(),
            ));
        }
        if self.agents.timeout < 60 {
            return Err(ConfigError::Invalid(
                "agents.timeout must be at least 60 seconds".into(),
            ));
        }
        if self.scheduler.poll_interval < 1 {
            return Err(ConfigError::Invalid(
                "scheduler.poll_interval must be at least 1 second".into(),
            ));
        }
        if self.scheduler.backlog_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "scheduler.backlog_path must not be empty".into(),
            ));
        }
        if self.ci.status_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "ci.status_path must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval)
    }
}
