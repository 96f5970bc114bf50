use super::{activator, FlowEngine};
use crate::error::EngineError;
use crate::queue::Queue;
use crate::store::{FlowStore, StateWriter};
use crate::types::{Run, RunId, RunStatus, StepSlug, StepState, StepStatus};
use crate::workflow::{WorkflowDag, WorkflowDefinition};
use anyhow::Result;
use chrono::Utc;

impl<S: FlowStore> FlowEngine<S> {
    /// Start a run of a registered workflow.
    ///
    /// The run, every step state, the root tasks and their queue messages are
    /// written in one transaction: either all of it exists or none of it.
    pub fn submit(&self, workflow_slug: &str, input: serde_json::Value) -> Result<RunId> {
        let definition = self
            .workflow(workflow_slug)?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_slug.to_string()))?;
        let dag = WorkflowDag::from_definition(&definition).map_err(EngineError::from)?;

        let now = Utc::now();
        let run = Run {
            id: RunId::new(),
            workflow_slug: definition.slug.clone(),
            input,
            status: RunStatus::Running,
            remaining_steps: definition.steps.len() as u32,
            output: None,
            error: None,
            created_at: now,
            completed_at: None,
        };

        let states: Vec<StepState> = definition
            .steps
            .iter()
            .map(|step| StepState {
                run_id: run.id,
                step_slug: step.slug.clone(),
                status: StepStatus::Pending,
                remaining_tasks: step.initial_tasks,
                remaining_deps: dag.dependency_count(&step.slug),
                spec: step.clone(),
                dependents: dag.dependents(&step.slug),
                output: None,
                error: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            })
            .collect();

        let roots: Vec<StepSlug> = dag
            .entry_steps()
            .into_iter()
            .map(|step| step.slug.clone())
            .collect();

        let activated = self.store.write(|scope| {
            scope.put_run(&run)?;
            for state in &states {
                scope.put_step_state(state)?;
            }
            scope.ensure_queue(definition.slug.as_str())?;
            activator::start_ready_steps(scope, &self.config, &run.id, &roots)
        })?;
        self.queue.notify_waiters();

        tracing::info!(
            "Started run {} of workflow {} ({} root step(s))",
            run.id,
            definition.slug,
            activated.len()
        );
        Ok(run.id)
    }

    /// Register `definition` (or confirm it matches what is registered) and
    /// start a run of it
    pub fn run_definition(
        &self,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<RunId> {
        let slug = definition.slug.clone();
        self.register_workflow(definition)?;
        self.submit(slug.as_str(), input)
    }
}
