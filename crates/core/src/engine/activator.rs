use super::FlowEngine;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::queue::Queue;
use crate::store::{FlowStore, StateWriter};
use crate::types::{RunId, RunStatus, StepSlug, StepStatus, Task, TaskId, TaskStatus};
use anyhow::Result;
use chrono::Utc;
use std::time::Duration;

/// Move every listed step that is `pending` with no remaining dependencies to
/// `started`, creating its tasks and enqueuing one message per task.
///
/// Steps that don't qualify are skipped, so calling this twice for the same
/// step creates nothing the second time. Nothing is activated once the run
/// has left `running`.
pub(crate) fn start_ready_steps<W: StateWriter>(
    scope: &W,
    config: &EngineConfig,
    run_id: &RunId,
    slugs: &[StepSlug],
) -> Result<Vec<StepSlug>> {
    let run = scope.run(run_id)?.ok_or(EngineError::RunNotFound(*run_id))?;
    if run.status != RunStatus::Running {
        tracing::debug!(
            "Not activating steps of run {}: run is {:?}",
            run_id,
            run.status
        );
        return Ok(Vec::new());
    }

    let queue = run.workflow_slug.as_str();
    let now = Utc::now();
    let mut activated = Vec::new();

    for slug in slugs {
        let Some(mut state) = scope.step_state(run_id, slug)? else {
            tracing::warn!("Step {} not found in run {}", slug, run_id);
            continue;
        };
        if state.status != StepStatus::Pending || state.remaining_deps > 0 {
            tracing::debug!(
                "Step {} of run {} not ready (status={:?}, remaining_deps={})",
                slug,
                run_id,
                state.status,
                state.remaining_deps
            );
            continue;
        }

        let max_attempts = state.spec.max_attempts.unwrap_or(config.retry.max_attempts);
        for index in 0..state.spec.initial_tasks {
            let id = TaskId::new(*run_id, slug.clone(), index);
            if scope.task(&id)?.is_some() {
                continue;
            }
            let msg_id = scope.send_message(queue, serde_json::to_value(&id)?, Duration::ZERO)?;
            scope.put_task(&Task {
                run_id: *run_id,
                step_slug: slug.clone(),
                task_index: index,
                status: TaskStatus::Queued,
                attempts_count: 0,
                max_attempts,
                queue_message_id: Some(msg_id),
                input: None,
                output: None,
                error: None,
                queued_at: now,
                started_at: None,
                completed_at: None,
            })?;
        }

        state.status = StepStatus::Started;
        state.started_at = Some(now);
        scope.put_step_state(&state)?;

        tracing::info!(
            "Started step {} of run {} with {} task(s)",
            slug,
            run_id,
            state.spec.initial_tasks
        );
        activated.push(slug.clone());
    }

    Ok(activated)
}

impl<S: FlowStore> FlowEngine<S> {
    /// Activate the given steps of a run if they are ready. Returns the steps
    /// actually started by this call.
    pub fn start_ready_steps(&self, run_id: &RunId, slugs: &[StepSlug]) -> Result<Vec<StepSlug>> {
        let activated = self
            .store
            .write(|scope| start_ready_steps(scope, &self.config, run_id, slugs))?;
        if !activated.is_empty() {
            self.queue.notify_waiters();
        }
        Ok(activated)
    }
}
