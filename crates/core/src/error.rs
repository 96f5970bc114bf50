//! Typed root causes carried inside `anyhow::Error`.
//!
//! Engine operations return `anyhow::Result`; callers that need to tell a bad
//! request from an infrastructure failure downcast to these types.

use crate::types::{RunId, TaskId};

/// Reasons a workflow definition is rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("Workflow has no steps")]
    Empty,

    #[error("Invalid slug '{0}': expected [A-Za-z_][A-Za-z0-9_-]*, at most 128 characters")]
    InvalidSlug(String),

    #[error("Step slug '{0}' is reserved")]
    ReservedSlug(String),

    #[error("Step '{0}' is defined more than once")]
    DuplicateStep(String),

    #[error("Step '{step}' lists dependency '{dependency}' more than once")]
    DuplicateDependency { step: String, dependency: String },

    #[error("Dependency '{dependency}' not found for step '{step}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step '{step}' has invalid task count {count}: {reason}")]
    InvalidTaskCount {
        step: String,
        count: u32,
        reason: &'static str,
    },

    #[error("Step '{step}' has invalid option: {reason}")]
    InvalidOption { step: String, reason: &'static str },

    #[error("Workflow contains circular dependencies")]
    Cycle,
}

/// Engine-level failures that callers may want to match on
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("Workflow '{0}' is already registered with a different definition")]
    WorkflowConflict(String),

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),
}
