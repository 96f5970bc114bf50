use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide defaults. Per-step options in a workflow definition override
/// the retry and timeout values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

fn default_task_timeout_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Task timeout for a step, honouring its override
    pub fn task_timeout(&self, step_timeout_secs: Option<u64>) -> Duration {
        Duration::from_secs(step_timeout_secs.unwrap_or(self.task_timeout_secs))
    }
}

/// Bounded retry with exponential backoff: `base * 2^attempts`, capped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl RetryConfig {
    /// Visibility delay before a failed task is retried.
    ///
    /// `attempts` is the number of claims the task has had so far.
    pub fn delay_for(&self, base_override: Option<u64>, attempts: u32) -> Duration {
        let base = base_override.unwrap_or(self.base_delay_secs);
        let factor = 2_u64.checked_pow(attempts).unwrap_or(u64::MAX);
        let secs = base.saturating_mul(factor).min(self.max_delay_secs);
        Duration::from_secs(secs)
    }
}

/// How the dispatcher polls the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Longest a single `start_tasks` call blocks waiting for messages
    #[serde(default = "default_max_poll_ms")]
    pub max_poll_ms: u64,

    /// Re-check interval while blocked
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Visibility timeout applied when a message is read, before the claim
    /// narrows it to the step's own timeout
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

fn default_max_poll_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_visibility_timeout_secs() -> u64 {
    62
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_poll_ms: default_max_poll_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

impl PollConfig {
    pub fn max_poll(&self) -> Duration {
        Duration::from_millis(self.max_poll_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}
