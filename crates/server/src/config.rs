use anyhow::{Context, Result};
use flowkeel_core::{EngineConfig, FlowEngine, RedbStore, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_state_file() -> String {
    "flowkeel.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

/// Embedded workers started alongside the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Workflow slugs to run a worker for. Empty disables embedded workers.
    #[serde(default)]
    pub workflows: Vec<String>,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_concurrency() -> usize {
    10
}

fn default_batch_size() -> usize {
    10
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workflows: Vec::new(),
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
        }
    }
}

impl WorkerSettings {
    pub fn worker_configs(&self) -> Vec<WorkerConfig> {
        self.workflows
            .iter()
            .map(|slug| {
                WorkerConfig::new(slug.as_str())
                    .with_concurrency(self.concurrency)
                    .with_batch_size(self.batch_size)
            })
            .collect()
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
                worker: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Path of the redb file holding all engine state
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: FlowEngine,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = RedbStore::open(config.state_path()).context("Failed to open state store")?;
        Ok(Self {
            engine: FlowEngine::new(store, config.engine.clone()),
        })
    }
}
