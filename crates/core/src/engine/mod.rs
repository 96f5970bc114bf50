//! Coordination core: run initialization, step activation, task dispatch and
//! completion cascades.
//!
//! Every operation is one serializable store transaction guarded on the
//! current status of the rows it touches. Losing a race means the guard does
//! not match, which is reported as an outcome rather than an error. That is
//! what makes at-least-once delivery and concurrent workers safe.

mod activator;
mod completion;
mod dispatcher;
mod initializer;

#[cfg(test)]
mod tests;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::store::{FlowStore, RedbStore, StateReader, StateWriter};
use crate::types::{ClaimedTask, Run, RunId, RunSnapshot, RunStatus, StepSlug};
use crate::workflow::{WorkflowDag, WorkflowDefinition};
use anyhow::Result;
use std::time::Duration;

pub use dispatcher::build_task_input;

/// The workflow engine. Stateless apart from its store handle, so any number
/// of instances (one per worker) can share a store.
///
/// Generic over the backend; every coordination step goes through
/// [`FlowStore`] transactions.
#[derive(Clone)]
pub struct FlowEngine<S: FlowStore = RedbStore> {
    store: S,
    queue: S::Queue,
    config: EngineConfig,
}

/// Result of trying to claim the task behind a delivered message
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(ClaimedTask),
    /// Another worker holds the task and its lease has not expired
    Leased,
    /// The message was archived without touching task state
    Discarded(&'static str),
    /// The previous holder's lease expired with no attempts left; the task
    /// failed terminally
    Exhausted,
}

/// Result of `complete_task`
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The task was not `started`; nothing changed
    Ignored,
    /// The run is no longer running; the output was dropped
    Discarded,
    /// Sibling tasks of the step are still outstanding
    TaskCompleted,
    StepCompleted {
        step: StepSlug,
        activated: Vec<StepSlug>,
    },
    RunCompleted,
}

/// Result of `fail_task`
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// The task was not `started`; nothing changed
    Ignored,
    /// The run is no longer running; the task was closed as failed
    Discarded,
    Retrying { attempt: u32, delay: Duration },
    /// Retries exhausted: task, step and run are now failed
    Failed,
}

impl<S: FlowStore> FlowEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        let queue = store.queue();
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &S::Queue {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and persist a workflow definition, creating its queue.
    ///
    /// Returns `false` if an identical definition was already registered.
    /// A different definition under an existing slug is rejected.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<bool> {
        WorkflowDag::from_definition(&definition).map_err(EngineError::from)?;

        let created = self.store.write(|scope| {
            if let Some(existing) = scope.workflow(definition.slug.as_str())? {
                if existing == definition {
                    return Ok(false);
                }
                return Err(EngineError::WorkflowConflict(definition.slug.0.clone()).into());
            }
            scope.put_workflow(&definition)?;
            scope.ensure_queue(definition.slug.as_str())?;
            Ok(true)
        })?;

        if created {
            tracing::info!(
                "Registered workflow {} with {} step(s)",
                definition.slug,
                definition.steps.len()
            );
        }
        Ok(created)
    }

    pub fn workflow(&self, slug: &str) -> Result<Option<WorkflowDefinition>> {
        self.store.read(|scope| scope.workflow(slug))
    }

    pub fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        self.store.read(|scope| scope.workflows())
    }

    /// Current state of a run with all of its steps and tasks
    pub fn get_run(&self, run_id: &RunId) -> Result<Option<RunSnapshot>> {
        self.store.snapshot(run_id)
    }

    pub fn list_runs(&self, workflow: Option<&str>) -> Result<Vec<Run>> {
        self.store.list_runs(workflow)
    }

    /// Cooperatively cancel a run: no further steps are activated and
    /// outputs of tasks still in flight are discarded when they report in.
    ///
    /// Returns `false` if the run had already finished.
    pub fn cancel_run(&self, run_id: &RunId) -> Result<bool> {
        let cancelled = self.store.write(|scope| {
            let mut run = scope
                .run(run_id)?
                .ok_or(EngineError::RunNotFound(*run_id))?;
            if run.status != RunStatus::Running {
                return Ok(false);
            }
            run.status = RunStatus::Cancelled;
            run.completed_at = Some(chrono::Utc::now());
            scope.put_run(&run)?;
            Ok(true)
        })?;

        if cancelled {
            tracing::info!("Cancelled run {}", run_id);
        }
        Ok(cancelled)
    }
}
