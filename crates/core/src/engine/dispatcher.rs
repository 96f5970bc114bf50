use super::{completion, ClaimOutcome, FlowEngine};
use crate::config::EngineConfig;
use crate::queue::{Queue, QueueMessage, ReadOptions};
use crate::store::{FlowStore, StateReader, StateWriter};
use crate::types::{ClaimedTask, Run, RunStatus, StepState, StepStatus, TaskId, TaskStatus};
use anyhow::{anyhow, ensure, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use std::time::Duration;

/// Added to the task timeout when extending a claimed message's visibility,
/// so the message reappears only after the lease has clearly expired
const LEASE_GRACE: Duration = Duration::from_secs(2);

impl<S: FlowStore> FlowEngine<S> {
    /// Poll the workflow's queue and claim up to `max_tasks` tasks.
    ///
    /// Blocks up to the configured poll window. Messages that turn out to be
    /// stale (terminal task, finished run, lease still held) are dealt with
    /// and left out of the result, so the batch can be shorter than what was
    /// read. A message whose claim fails is logged and skipped; it reappears
    /// once its visibility timeout lapses.
    pub async fn start_tasks(&self, workflow_slug: &str, max_tasks: usize) -> Result<Vec<ClaimedTask>> {
        let options = ReadOptions {
            visibility_timeout: self.config.poll.visibility_timeout(),
            max_messages: max_tasks,
            max_poll: self.config.poll.max_poll(),
            poll_interval: self.config.poll.poll_interval(),
        };
        let messages = self.queue.read_with_poll(workflow_slug, options).await?;

        let mut claimed = Vec::with_capacity(messages.len());
        for message in &messages {
            match self.claim_message(workflow_slug, message) {
                Ok(ClaimOutcome::Claimed(task)) => claimed.push(task),
                Ok(other) => tracing::debug!("Message {} not claimed: {:?}", message.msg_id, other),
                Err(e) => tracing::error!(
                    "Failed to claim message {} on queue {}: {:#}",
                    message.msg_id,
                    workflow_slug,
                    e
                ),
            }
        }
        Ok(claimed)
    }

    /// Claim the task behind one delivered message
    pub fn claim_message(&self, queue: &str, message: &QueueMessage) -> Result<ClaimOutcome> {
        self.store
            .write(|scope| claim_in(scope, &self.config, queue, message))
    }
}

fn claim_in<W: StateWriter>(
    scope: &W,
    config: &EngineConfig,
    queue: &str,
    message: &QueueMessage,
) -> Result<ClaimOutcome> {
    let task_id: TaskId = match serde_json::from_value(message.message.clone()) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(
                "Archiving undecodable message {} on queue {}: {}",
                message.msg_id,
                queue,
                e
            );
            scope.archive_message(queue, message.msg_id)?;
            return Ok(ClaimOutcome::Discarded("undecodable payload"));
        }
    };

    let Some(mut task) = scope.task(&task_id)? else {
        tracing::warn!("Archiving message {} for unknown task {}", message.msg_id, task_id);
        scope.archive_message(queue, message.msg_id)?;
        return Ok(ClaimOutcome::Discarded("unknown task"));
    };
    let Some(run) = scope.run(&task_id.run_id)? else {
        scope.archive_message(queue, message.msg_id)?;
        return Ok(ClaimOutcome::Discarded("unknown run"));
    };
    if run.status != RunStatus::Running {
        tracing::debug!(
            "Archiving message {} for task {}: run is {:?}",
            message.msg_id,
            task_id,
            run.status
        );
        scope.archive_message(queue, message.msg_id)?;
        return Ok(ClaimOutcome::Discarded("run not running"));
    }
    let state = scope
        .step_state(&run.id, &task_id.step_slug)?
        .ok_or_else(|| anyhow!("Step state {} missing for run {}", task_id.step_slug, run.id))?;
    let timeout = config.task_timeout(state.spec.timeout_secs);

    match task.status {
        TaskStatus::Queued => {}
        TaskStatus::Started => {
            let held_for = task
                .started_at
                .map(|started| (Utc::now() - started).to_std().unwrap_or_default())
                .unwrap_or(Duration::MAX);
            if held_for < timeout {
                tracing::debug!(
                    "Task {} already started, skipping redelivery (read_ct={})",
                    task_id,
                    message.read_ct
                );
                // Hide the message until the current lease would expire
                let remaining = timeout.saturating_sub(held_for).saturating_add(LEASE_GRACE);
                scope.set_message_vt(queue, message.msg_id, remaining)?;
                return Ok(ClaimOutcome::Leased);
            }
            if task.attempts_count >= task.max_attempts {
                let error = format!(
                    "Task timed out after {:?} with no attempts left ({}/{})",
                    timeout, task.attempts_count, task.max_attempts
                );
                tracing::error!("Task {}: {}", task_id, error);
                completion::fail_terminally(scope, run, state, task, &error)?;
                return Ok(ClaimOutcome::Exhausted);
            }
            tracing::warn!(
                "Reclaiming task {} after lease expiry (attempt {}/{})",
                task_id,
                task.attempts_count,
                task.max_attempts
            );
        }
        TaskStatus::Completed | TaskStatus::Failed => {
            scope.archive_message(queue, message.msg_id)?;
            return Ok(ClaimOutcome::Discarded("task already finished"));
        }
    }

    let input = build_task_input(scope, &run, &state, task.task_index)?;

    task.status = TaskStatus::Started;
    task.attempts_count += 1;
    task.started_at = Some(Utc::now());
    task.queue_message_id = Some(message.msg_id);
    task.input = Some(input.clone());
    scope.put_task(&task)?;
    scope.set_message_vt(queue, message.msg_id, timeout.saturating_add(LEASE_GRACE))?;

    tracing::debug!(
        "Claimed task {} (attempt {}/{})",
        task_id,
        task.attempts_count,
        task.max_attempts
    );

    Ok(ClaimOutcome::Claimed(ClaimedTask {
        id: task_id,
        workflow_slug: run.workflow_slug.clone(),
        handler: state.spec.handler.clone(),
        input,
        attempt: task.attempts_count,
        max_attempts: task.max_attempts,
        timeout,
        message_id: message.msg_id,
    }))
}

/// Assemble the input object handed to a task's handler: the run input under
/// `"run"` plus each dependency's output under its slug. Map tasks also get
/// their `task_index` and the matching `item` of the array they fan out over
/// (the single dependency's output, or the run input for a root map step).
pub fn build_task_input<R: StateReader>(
    reader: &R,
    run: &Run,
    state: &StepState,
    task_index: u32,
) -> Result<Value> {
    let mut input = Map::new();
    input.insert("run".to_string(), run.input.clone());

    for dep in &state.spec.depends_on {
        let dep_state = reader
            .step_state(&run.id, dep)?
            .ok_or_else(|| anyhow!("Dependency {} of step {} missing", dep, state.step_slug))?;
        ensure!(
            dep_state.status == StepStatus::Completed,
            "Dependency {} of step {} has not completed",
            dep,
            state.step_slug
        );
        input.insert(dep.0.clone(), dep_state.output.unwrap_or(Value::Null));
    }

    if state.spec.is_map() {
        let item = match state.spec.depends_on.as_slice() {
            [] => Some(&run.input),
            [only] => input.get(only.as_str()),
            _ => None,
        }
        .and_then(Value::as_array)
        .and_then(|items| items.get(task_index as usize))
        .cloned()
        .unwrap_or(Value::Null);

        input.insert("task_index".to_string(), Value::from(task_index));
        input.insert("item".to_string(), item);
    }

    Ok(Value::Object(input))
}
