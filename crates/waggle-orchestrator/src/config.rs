use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use waggle_core::{WaggleError, WaggleResult};

/// Runtime configuration for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Global bound on simultaneously executing tasks.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-task execution timeout; a template's `timeout_secs` overrides it.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Root directory for position records, templates, and event segments.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./waggle-data")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            task_timeout_secs: default_task_timeout_secs(),
            data_dir: default_data_dir(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> WaggleResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path).await?;
        toml::from_str(&data).map_err(|e| {
            WaggleError::Config(format!("invalid config at {}: {e}", path.display()))
        })
    }
}
