use crate::error::DefinitionError;
use crate::types::{StepSlug, WorkflowSlug};
use serde::{Deserialize, Serialize};

/// Step slugs that would collide with keys of the task input object
pub const RESERVED_STEP_SLUGS: &[&str] = &["run", "task_index", "item"];

const MAX_SLUG_LEN: usize = 128;

/// Longest per-step task timeout accepted (one week)
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Largest per-step retry base delay accepted (one day)
pub const MAX_BASE_DELAY_SECS: u64 = 24 * 60 * 60;

/// Static definition of a workflow: an ordered list of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub slug: WorkflowSlug,
    pub steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: WorkflowSlug::new(slug),
            steps: Vec::new(),
        }
    }

    /// Append a step (builder style)
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }
}

/// Whether a step runs once or fans out into a fixed number of tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Single,
    Map,
}

/// Specification for a single workflow step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub slug: StepSlug,

    #[serde(default)]
    pub depends_on: Vec<StepSlug>,

    #[serde(default)]
    pub kind: StepKind,

    #[serde(default = "default_initial_tasks")]
    pub initial_tasks: u32,

    /// Name of the handler in the worker's handler registry
    pub handler: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_initial_tasks() -> u32 {
    1
}

impl StepSpec {
    /// A step that runs exactly one task
    pub fn new(slug: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            slug: StepSlug::new(slug),
            depends_on: Vec::new(),
            kind: StepKind::Single,
            initial_tasks: 1,
            handler: handler.into(),
            max_attempts: None,
            base_delay_secs: None,
            timeout_secs: None,
        }
    }

    /// A fan-out step with a fixed task count
    pub fn map(slug: impl Into<String>, handler: impl Into<String>, tasks: u32) -> Self {
        Self {
            kind: StepKind::Map,
            initial_tasks: tasks,
            ..Self::new(slug, handler)
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(|d| StepSlug::new(d)).collect();
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn base_delay_secs(mut self, secs: u64) -> Self {
        self.base_delay_secs = Some(secs);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn is_map(&self) -> bool {
        self.kind == StepKind::Map
    }

    /// Per-step checks that don't need the rest of the graph
    pub(crate) fn validate(&self) -> Result<(), DefinitionError> {
        validate_slug(self.slug.as_str())?;
        if RESERVED_STEP_SLUGS.contains(&self.slug.as_str()) {
            return Err(DefinitionError::ReservedSlug(self.slug.0.clone()));
        }

        match self.kind {
            StepKind::Single if self.initial_tasks != 1 => {
                return Err(DefinitionError::InvalidTaskCount {
                    step: self.slug.0.clone(),
                    count: self.initial_tasks,
                    reason: "single steps run exactly one task",
                });
            }
            StepKind::Map if self.initial_tasks == 0 => {
                return Err(DefinitionError::InvalidTaskCount {
                    step: self.slug.0.clone(),
                    count: 0,
                    reason: "map steps need at least one task",
                });
            }
            _ => {}
        }

        if self.max_attempts == Some(0) {
            return Err(DefinitionError::InvalidOption {
                step: self.slug.0.clone(),
                reason: "max_attempts must be at least 1",
            });
        }
        match self.timeout_secs {
            Some(0) => {
                return Err(DefinitionError::InvalidOption {
                    step: self.slug.0.clone(),
                    reason: "timeout_secs must be at least 1",
                });
            }
            Some(secs) if secs > MAX_TIMEOUT_SECS => {
                return Err(DefinitionError::InvalidOption {
                    step: self.slug.0.clone(),
                    reason: "timeout_secs must be at most 604800 (one week)",
                });
            }
            _ => {}
        }
        if self.base_delay_secs.is_some_and(|secs| secs > MAX_BASE_DELAY_SECS) {
            return Err(DefinitionError::InvalidOption {
                step: self.slug.0.clone(),
                reason: "base_delay_secs must be at most 86400 (one day)",
            });
        }

        for (i, dep) in self.depends_on.iter().enumerate() {
            if self.depends_on[..i].contains(dep) {
                return Err(DefinitionError::DuplicateDependency {
                    step: self.slug.0.clone(),
                    dependency: dep.0.clone(),
                });
            }
        }

        Ok(())
    }
}

pub(crate) fn validate_slug(slug: &str) -> Result<(), DefinitionError> {
    let mut chars = slug.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid_head && valid_tail && slug.len() <= MAX_SLUG_LEN {
        Ok(())
    } else {
        Err(DefinitionError::InvalidSlug(slug.to_string()))
    }
}
