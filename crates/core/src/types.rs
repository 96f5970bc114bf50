use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::StepSpec;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Slug identifying a registered workflow (also the name of its queue)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowSlug(pub String);

impl WorkflowSlug {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slug identifying a step within a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepSlug(pub String);

impl StepSlug {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a task, and the whole payload of its queue message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub run_id: RunId,
    pub step_slug: StepSlug,
    pub task_index: u32,
}

impl TaskId {
    pub fn new(run_id: RunId, step_slug: StepSlug, task_index: u32) -> Self {
        Self {
            run_id,
            step_slug,
            task_index,
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.run_id, self.step_slug, self.task_index)
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Status of a step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Started,
    Completed,
    Failed,
}

/// Status of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// One execution of a workflow against a specific input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_slug: WorkflowSlug,
    pub input: serde_json::Value,
    pub status: RunStatus,
    /// Steps that have not reached `completed` yet
    pub remaining_steps: u32,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-run state of one step.
///
/// Dependency edges are materialized here as counters (`remaining_deps`) and
/// a `dependents` list, so cascades never walk the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub run_id: RunId,
    pub step_slug: StepSlug,
    pub status: StepStatus,
    pub remaining_tasks: u32,
    pub remaining_deps: u32,
    /// Snapshot of the step definition taken when the run was created
    pub spec: StepSpec,
    pub dependents: Vec<StepSlug>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One executable unit of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub run_id: RunId,
    pub step_slug: StepSlug,
    pub task_index: u32,
    pub status: TaskStatus,
    pub attempts_count: u32,
    pub max_attempts: u32,
    pub queue_message_id: Option<i64>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        TaskId::new(self.run_id, self.step_slug.clone(), self.task_index)
    }
}

/// Point-in-time view of a run for status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub steps: Vec<StepState>,
    pub tasks: Vec<Task>,
}

impl RunSnapshot {
    pub fn step(&self, slug: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.step_slug.as_str() == slug)
    }

    pub fn tasks_for(&self, slug: &str) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.step_slug.as_str() == slug)
            .collect()
    }
}

/// A claimed task, hydrated with everything a worker needs to execute it
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub workflow_slug: WorkflowSlug,
    pub handler: String,
    pub input: serde_json::Value,
    /// 1-based attempt number of this claim
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout: std::time::Duration,
    pub message_id: i64,
}
