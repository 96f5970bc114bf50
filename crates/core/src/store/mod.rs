//! State store seam and its redb implementation.
//!
//! The engine only talks to [`FlowStore`]: a transactional backend handing
//! out [`StateReader`] snapshots and [`StateWriter`] transactions. Queue
//! operations the engine needs mid-transaction live on the writer, so a task
//! row and its queue message always commit together.

mod redb_store;
pub mod schema;

use anyhow::Result;
use serde_json::Value;
use std::time::Duration;

use crate::queue::Queue;
use crate::types::{Run, RunId, RunSnapshot, StepSlug, StepState, Task, TaskId};
use crate::workflow::WorkflowDefinition;

pub(crate) use redb_store::RecordReader;
pub use redb_store::{ReadScope, RedbStore, WriteScope};

/// Typed reads over one consistent view of the state
pub trait StateReader {
    fn workflow(&self, slug: &str) -> Result<Option<WorkflowDefinition>>;

    fn workflows(&self) -> Result<Vec<WorkflowDefinition>>;

    fn run(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// Every run, in no particular order
    fn runs(&self) -> Result<Vec<Run>>;

    fn step_state(&self, run_id: &RunId, step: &StepSlug) -> Result<Option<StepState>>;

    fn step_states(&self, run_id: &RunId) -> Result<Vec<StepState>>;

    fn task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Tasks of one step, ordered by `task_index`
    fn step_tasks(&self, run_id: &RunId, step: &StepSlug) -> Result<Vec<Task>>;

    fn run_tasks(&self, run_id: &RunId) -> Result<Vec<Task>>;
}

/// Writes inside one open transaction
pub trait StateWriter: StateReader {
    fn put_workflow(&self, workflow: &WorkflowDefinition) -> Result<()>;

    fn put_run(&self, run: &Run) -> Result<()>;

    fn put_step_state(&self, state: &StepState) -> Result<()>;

    fn put_task(&self, task: &Task) -> Result<()>;

    /// Create `queue` if it does not exist yet
    fn ensure_queue(&self, queue: &str) -> Result<()>;

    /// Enqueue a message hidden for `delay`, returning its id
    fn send_message(&self, queue: &str, message: Value, delay: Duration) -> Result<i64>;

    /// Returns whether the message was still in the queue
    fn archive_message(&self, queue: &str, msg_id: i64) -> Result<bool>;

    /// Hide a message until `delay` from now. Returns whether it was present.
    fn set_message_vt(&self, queue: &str, msg_id: i64, delay: Duration) -> Result<bool>;
}

/// A transactional backend the engine can run on
pub trait FlowStore: Clone + Send + Sync + 'static {
    type Reader: StateReader;
    type Writer: StateWriter;
    type Queue: Queue + Clone + 'static;

    /// Run `f` against a consistent read snapshot
    fn read<T>(&self, f: impl FnOnce(&Self::Reader) -> Result<T>) -> Result<T>;

    /// Run `f` inside one serializable write transaction. The transaction
    /// commits only if `f` returns `Ok`; any error aborts every write made
    /// by `f`.
    fn write<T>(&self, f: impl FnOnce(&Self::Writer) -> Result<T>) -> Result<T>;

    /// Queue handle over the same storage as this store's transactions
    fn queue(&self) -> Self::Queue;

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.read(|scope| scope.run(run_id))
    }

    fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.read(|scope| scope.task(task_id))
    }

    /// All runs, most recent first, optionally for one workflow
    fn list_runs(&self, workflow: Option<&str>) -> Result<Vec<Run>> {
        let mut runs = self.read(|scope| scope.runs())?;
        if let Some(workflow) = workflow {
            runs.retain(|r| r.workflow_slug.as_str() == workflow);
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    /// Run, step states and tasks from one read snapshot
    fn snapshot(&self, run_id: &RunId) -> Result<Option<RunSnapshot>> {
        self.read(|scope| {
            let Some(run) = scope.run(run_id)? else {
                return Ok(None);
            };
            Ok(Some(RunSnapshot {
                steps: scope.step_states(run_id)?,
                tasks: scope.run_tasks(run_id)?,
                run,
            }))
        })
    }
}
