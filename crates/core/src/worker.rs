//! Worker loop: poll for claimable tasks, run their handlers with bounded
//! concurrency, and report each outcome back to the engine.

use crate::engine::FlowEngine;
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::store::{FlowStore, RedbStore};
use crate::types::ClaimedTask;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Worker settings for one workflow queue
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workflow: String,
    /// Maximum number of handlers running at once
    pub concurrency: usize,
    /// Maximum number of tasks claimed per poll
    pub batch_size: usize,
    /// First delay after a failed poll; doubles on each consecutive failure
    pub error_backoff: Duration,
    pub max_error_backoff: Duration,
}

impl WorkerConfig {
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            concurrency: 10,
            batch_size: 10,
            error_backoff: Duration::from_millis(200),
            max_error_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn backoff(&self, consecutive_errors: u32) -> Duration {
        let factor = 2_u32.saturating_pow(consecutive_errors.saturating_sub(1));
        self.error_backoff
            .saturating_mul(factor)
            .min(self.max_error_backoff)
    }
}

/// Counters reported when a worker stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Executes tasks of one workflow. Any number of workers may run against the
/// same store; claims are exclusive per task.
pub struct Worker<S: FlowStore = RedbStore> {
    engine: FlowEngine<S>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl<S: FlowStore> Worker<S> {
    pub fn new(engine: FlowEngine<S>, handlers: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        Self {
            engine,
            handlers,
            config,
        }
    }

    /// Run until `shutdown` is cancelled, then wait for in-flight handlers to
    /// finish and report them before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerStats> {
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut in_flight: JoinSet<Result<bool>> = JoinSet::new();
        let mut stats = WorkerStats::default();
        let mut consecutive_errors = 0u32;

        tracing::info!(
            "Worker started for workflow {} (concurrency={}, batch_size={}, handlers={:?})",
            self.config.workflow,
            concurrency,
            self.config.batch_size,
            self.handlers.names()
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                record(joined, &mut stats);
            }
            if shutdown.is_cancelled() {
                break;
            }

            let free = semaphore.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(joined) = in_flight.join_next() => record(joined, &mut stats),
                }
                continue;
            }

            let batch = self.config.batch_size.max(1).min(free);
            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.engine.start_tasks(&self.config.workflow, batch) => result,
            };

            match claimed {
                Ok(tasks) => {
                    consecutive_errors = 0;
                    for task in tasks {
                        stats.claimed += 1;
                        let permit = semaphore.clone().acquire_owned().await?;
                        let engine = self.engine.clone();
                        let handler = self.handlers.get(&task.handler);
                        in_flight.spawn(async move {
                            let _permit = permit;
                            execute(engine, handler, task).await
                        });
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = self.config.backoff(consecutive_errors);
                    tracing::error!(
                        "Polling workflow {} failed: {:#} (retrying in {:?})",
                        self.config.workflow,
                        e,
                        backoff
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        tracing::info!(
            "Worker for workflow {} stopping, draining {} in-flight task(s)",
            self.config.workflow,
            in_flight.len()
        );
        while let Some(joined) = in_flight.join_next().await {
            record(joined, &mut stats);
        }

        tracing::info!(
            "Worker for workflow {} stopped: {} claimed, {} completed, {} failed",
            self.config.workflow,
            stats.claimed,
            stats.completed,
            stats.failed
        );
        Ok(stats)
    }
}

fn record(joined: Result<Result<bool>, JoinError>, stats: &mut WorkerStats) {
    match joined {
        Ok(Ok(true)) => stats.completed += 1,
        Ok(Ok(false)) => stats.failed += 1,
        Ok(Err(e)) => {
            stats.failed += 1;
            tracing::error!("Failed to report task outcome: {:#}", e);
        }
        Err(e) => {
            stats.failed += 1;
            tracing::error!("Task execution aborted: {}", e);
        }
    }
}

/// Run one claimed task and report it. Returns whether the handler succeeded.
///
/// The handler runs on its own tokio task so a panic surfaces as a failed
/// attempt instead of taking the worker down.
async fn execute<S: FlowStore>(
    engine: FlowEngine<S>,
    handler: Option<Arc<dyn TaskHandler>>,
    task: ClaimedTask,
) -> Result<bool> {
    let result = match handler {
        None => Err(format!("No handler registered under '{}'", task.handler)),
        Some(handler) => {
            let input = task.input.clone();
            let mut handle = tokio::spawn(async move { handler.handle(input).await });
            match tokio::time::timeout(task.timeout, &mut handle).await {
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
                Ok(Err(e)) => Err(format!("Handler panicked: {}", e)),
                Err(_) => {
                    handle.abort();
                    Err(format!("Task timed out after {:?}", task.timeout))
                }
            }
        }
    };

    match result {
        Ok(output) => {
            let outcome = engine.complete_task(&task.id, output)?;
            tracing::debug!("Task {} completed: {:?}", task.id, outcome);
            Ok(true)
        }
        Err(error) => {
            tracing::warn!(
                "Task {} failed on attempt {}/{}: {}",
                task.id,
                task.attempt,
                task.max_attempts,
                error
            );
            engine.fail_task(&task.id, &error)?;
            Ok(false)
        }
    }
}
