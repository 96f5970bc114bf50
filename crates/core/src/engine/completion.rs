use super::{activator, CompletionOutcome, FailureOutcome, FlowEngine};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::queue::Queue;
use crate::store::{FlowStore, StateWriter};
use crate::types::{Run, RunStatus, StepState, StepStatus, Task, TaskId, TaskStatus};
use crate::workflow::StepSpec;
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{Map, Value};

impl<S: FlowStore> FlowEngine<S> {
    /// Record a task's output and cascade: finish the step once its last
    /// task lands, release dependents, and finish the run once its last step
    /// lands. All of it commits atomically.
    pub fn complete_task(&self, task_id: &TaskId, output: Value) -> Result<CompletionOutcome> {
        let outcome = self
            .store
            .write(|scope| complete_in(scope, &self.config, task_id, output))?;

        if let CompletionOutcome::StepCompleted { activated, .. } = &outcome {
            if !activated.is_empty() {
                self.queue.notify_waiters();
            }
        }
        Ok(outcome)
    }

    /// Record a failed attempt. The task is requeued with backoff while it
    /// has attempts left; after that the task, its step and the run fail.
    pub fn fail_task(&self, task_id: &TaskId, error: &str) -> Result<FailureOutcome> {
        let outcome = self
            .store
            .write(|scope| fail_in(scope, &self.config, task_id, error))?;

        if let FailureOutcome::Retrying { delay, .. } = &outcome {
            if delay.is_zero() {
                self.queue.notify_waiters();
            }
        }
        Ok(outcome)
    }
}

fn complete_in<W: StateWriter>(
    scope: &W,
    config: &EngineConfig,
    task_id: &TaskId,
    output: Value,
) -> Result<CompletionOutcome> {
    let mut task = scope
        .task(task_id)?
        .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))?;
    if task.status != TaskStatus::Started {
        tracing::debug!(
            "Ignoring completion of task {}: task is {:?}",
            task_id,
            task.status
        );
        return Ok(CompletionOutcome::Ignored);
    }
    let mut run = scope
        .run(&task_id.run_id)?
        .ok_or(EngineError::RunNotFound(task_id.run_id))?;

    let now = Utc::now();
    task.status = TaskStatus::Completed;
    task.completed_at = Some(now);
    if let Some(msg_id) = task.queue_message_id {
        scope.archive_message(run.workflow_slug.as_str(), msg_id)?;
    }

    if run.status != RunStatus::Running {
        scope.put_task(&task)?;
        tracing::info!(
            "Discarding output of task {}: run is {:?}",
            task_id,
            run.status
        );
        return Ok(CompletionOutcome::Discarded);
    }

    task.output = Some(output);
    scope.put_task(&task)?;

    let mut state = scope
        .step_state(&run.id, &task_id.step_slug)?
        .ok_or_else(|| anyhow!("Step state {} missing for run {}", task_id.step_slug, run.id))?;
    state.remaining_tasks = state.remaining_tasks.saturating_sub(1);
    if state.remaining_tasks > 0 || state.status != StepStatus::Started {
        scope.put_step_state(&state)?;
        return Ok(CompletionOutcome::TaskCompleted);
    }

    let tasks = scope.step_tasks(&run.id, &state.step_slug)?;
    state.output = Some(aggregate_output(&state.spec, &tasks));
    state.status = StepStatus::Completed;
    state.completed_at = Some(now);
    scope.put_step_state(&state)?;
    tracing::info!("Step {} of run {} completed", state.step_slug, run.id);

    run.remaining_steps = run.remaining_steps.saturating_sub(1);
    if run.remaining_steps == 0 {
        let states = scope.step_states(&run.id)?;
        run.output = Some(run_output(&states));
        run.status = RunStatus::Completed;
        run.completed_at = Some(now);
        scope.put_run(&run)?;
        tracing::info!("Run {} completed", run.id);
        return Ok(CompletionOutcome::RunCompleted);
    }
    scope.put_run(&run)?;

    let mut ready = Vec::new();
    for dependent in &state.dependents {
        let mut dep_state = scope
            .step_state(&run.id, dependent)?
            .ok_or_else(|| anyhow!("Step state {} missing for run {}", dependent, run.id))?;
        dep_state.remaining_deps = dep_state.remaining_deps.saturating_sub(1);
        scope.put_step_state(&dep_state)?;
        if dep_state.remaining_deps == 0 {
            ready.push(dependent.clone());
        }
    }
    let activated = activator::start_ready_steps(scope, config, &run.id, &ready)?;

    Ok(CompletionOutcome::StepCompleted {
        step: state.step_slug,
        activated,
    })
}

fn fail_in<W: StateWriter>(
    scope: &W,
    config: &EngineConfig,
    task_id: &TaskId,
    error: &str,
) -> Result<FailureOutcome> {
    let mut task = scope
        .task(task_id)?
        .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))?;
    if task.status != TaskStatus::Started {
        tracing::debug!(
            "Ignoring failure of task {}: task is {:?}",
            task_id,
            task.status
        );
        return Ok(FailureOutcome::Ignored);
    }
    let run = scope
        .run(&task_id.run_id)?
        .ok_or(EngineError::RunNotFound(task_id.run_id))?;
    let queue = run.workflow_slug.as_str();

    task.error = Some(error.to_string());

    if run.status != RunStatus::Running {
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        if let Some(msg_id) = task.queue_message_id {
            scope.archive_message(queue, msg_id)?;
        }
        scope.put_task(&task)?;
        return Ok(FailureOutcome::Discarded);
    }

    let state = scope
        .step_state(&run.id, &task_id.step_slug)?
        .ok_or_else(|| anyhow!("Step state {} missing for run {}", task_id.step_slug, run.id))?;

    if task.attempts_count < task.max_attempts {
        let delay = config
            .retry
            .delay_for(state.spec.base_delay_secs, task.attempts_count);

        let requeued = match task.queue_message_id {
            Some(msg_id) => scope.set_message_vt(queue, msg_id, delay)?,
            None => false,
        };
        if !requeued {
            let msg_id = scope.send_message(queue, serde_json::to_value(task_id)?, delay)?;
            task.queue_message_id = Some(msg_id);
        }
        task.status = TaskStatus::Queued;
        scope.put_task(&task)?;

        tracing::warn!(
            "Task {} failed (attempt {}/{}), retrying in {:?}: {}",
            task_id,
            task.attempts_count,
            task.max_attempts,
            delay,
            error
        );
        return Ok(FailureOutcome::Retrying {
            attempt: task.attempts_count,
            delay,
        });
    }

    fail_terminally(scope, run, state, task, error)?;
    Ok(FailureOutcome::Failed)
}

/// Mark a task, its step and its run as failed, archiving the task's message
pub(crate) fn fail_terminally<W: StateWriter>(
    scope: &W,
    mut run: Run,
    mut state: StepState,
    mut task: Task,
    error: &str,
) -> Result<()> {
    let now = Utc::now();

    task.status = TaskStatus::Failed;
    task.error = Some(error.to_string());
    task.completed_at = Some(now);
    if let Some(msg_id) = task.queue_message_id {
        scope.archive_message(run.workflow_slug.as_str(), msg_id)?;
    }
    scope.put_task(&task)?;

    state.status = StepStatus::Failed;
    state.error = Some(error.to_string());
    state.completed_at = Some(now);
    scope.put_step_state(&state)?;

    run.status = RunStatus::Failed;
    run.error = Some(format!(
        "step '{}' task {} failed: {}",
        task.step_slug, task.task_index, error
    ));
    run.completed_at = Some(now);
    scope.put_run(&run)?;

    tracing::error!("Run {} failed: {}", run.id, error);
    Ok(())
}

/// A single step's output is its task's output; a map step's output is the
/// array of its task outputs in `task_index` order.
fn aggregate_output(spec: &StepSpec, tasks: &[Task]) -> Value {
    let mut outputs = tasks
        .iter()
        .map(|t| t.output.clone().unwrap_or(Value::Null));
    if spec.is_map() {
        Value::Array(outputs.collect())
    } else {
        outputs.next().unwrap_or(Value::Null)
    }
}

/// With one leaf step the run output is that step's output, otherwise an
/// object keyed by leaf slug.
fn run_output(states: &[StepState]) -> Value {
    let leaves: Vec<&StepState> = states.iter().filter(|s| s.dependents.is_empty()).collect();
    match leaves.as_slice() {
        [only] => only.output.clone().unwrap_or(Value::Null),
        _ => {
            let mut output = Map::new();
            for leaf in leaves {
                output.insert(
                    leaf.step_slug.0.clone(),
                    leaf.output.clone().unwrap_or(Value::Null),
                );
            }
            Value::Object(output)
        }
    }
}
