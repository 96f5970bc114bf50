//! redb-backed store. Every guarded status transition and counter update
//! happens inside a single redb write transaction. redb serializes writers,
//! so two workers finishing sibling tasks at the same moment can never lose
//! an update.

use anyhow::{Context, Result};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::schema::{
    self, run_key, run_prefix, step_key, step_task_prefix, task_key, META_TABLE, RUNS_TABLE,
    STEP_STATES_TABLE, TASKS_TABLE, WORKFLOWS_TABLE,
};
use super::{FlowStore, StateReader, StateWriter};
use crate::queue::RedbQueue;
use crate::types::{Run, RunId, StepSlug, StepState, Task, TaskId};
use crate::workflow::WorkflowDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Handle to the redb database holding runs, step states, tasks and the
/// queue's backing tables. Cheap to clone.
///
/// redb locks its file, so one process owns a store; workers in that process
/// share it through clones of this handle.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    notify: Arc<Notify>,
}

impl RedbStore {
    /// Open (or create) a store file and run pending migrations
    pub fn open(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;
        Self::init(db)
    }

    /// Non-persistent store, for tests and embedded use
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context("Failed to create in-memory database")?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        schema::migrate(&db)?;
        Ok(Self {
            db: Arc::new(db),
            notify: Arc::new(Notify::new()),
        })
    }

    /// Wakeup shared by every queue handle of this store
    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

impl FlowStore for RedbStore {
    type Reader = ReadScope;
    type Writer = WriteScope;
    type Queue = RedbQueue;

    fn read<T>(&self, f: impl FnOnce(&Self::Reader) -> Result<T>) -> Result<T> {
        let txn = self.db.begin_read().context("Failed to begin read")?;
        f(&ReadScope { txn })
    }

    fn write<T>(&self, f: impl FnOnce(&Self::Writer) -> Result<T>) -> Result<T> {
        let scope = WriteScope {
            txn: self.db.begin_write().context("Failed to begin write")?,
        };

        match f(&scope) {
            Ok(value) => {
                scope.txn.commit().context("Failed to commit")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = scope.txn.abort() {
                    tracing::warn!("Failed to abort write transaction: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    fn queue(&self) -> RedbQueue {
        RedbQueue::new(self.clone())
    }
}

/// Raw JSON record access shared by read and write transactions
pub trait RecordReader {
    fn get_record<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> Result<Option<T>>;

    /// Records whose key starts with `prefix`, in key order
    fn scan_records<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> Result<Vec<T>>;
}

impl<R: RecordReader> StateReader for R {
    fn workflow(&self, slug: &str) -> Result<Option<WorkflowDefinition>> {
        self.get_record(WORKFLOWS_TABLE, slug)
    }

    fn workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        self.scan_records(WORKFLOWS_TABLE, "")
    }

    fn run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.get_record(RUNS_TABLE, &run_key(run_id))
    }

    fn runs(&self) -> Result<Vec<Run>> {
        self.scan_records(RUNS_TABLE, "")
    }

    fn step_state(&self, run_id: &RunId, step: &StepSlug) -> Result<Option<StepState>> {
        self.get_record(STEP_STATES_TABLE, &step_key(run_id, step))
    }

    fn step_states(&self, run_id: &RunId) -> Result<Vec<StepState>> {
        self.scan_records(STEP_STATES_TABLE, &run_prefix(run_id))
    }

    fn task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.get_record(TASKS_TABLE, &task_key(&id.run_id, &id.step_slug, id.task_index))
    }

    fn step_tasks(&self, run_id: &RunId, step: &StepSlug) -> Result<Vec<Task>> {
        self.scan_records(TASKS_TABLE, &step_task_prefix(run_id, step))
    }

    fn run_tasks(&self, run_id: &RunId) -> Result<Vec<Task>> {
        self.scan_records(TASKS_TABLE, &run_prefix(run_id))
    }
}

fn get_from<T, R>(table: &R, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).context("Failed to get record")? {
        Some(guard) => {
            let record = serde_json::from_slice(guard.value())
                .with_context(|| format!("Failed to deserialize record {}", key))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn scan_from<T, R>(table: &R, prefix: &str) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut records = Vec::new();
    for item in table.range(prefix..).context("Failed to scan table")? {
        let (key, value) = item.context("Failed to read item")?;
        if !key.value().starts_with(prefix) {
            break;
        }
        let record = serde_json::from_slice(value.value())
            .with_context(|| format!("Failed to deserialize record {}", key.value()))?;
        records.push(record);
    }
    Ok(records)
}

/// Read-only view over one snapshot
pub struct ReadScope {
    txn: ReadTransaction,
}

impl RecordReader for ReadScope {
    fn get_record<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> Result<Option<T>> {
        let table = self.txn.open_table(table).context("Failed to open table")?;
        get_from(&table, key)
    }

    fn scan_records<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> Result<Vec<T>> {
        let table = self.txn.open_table(table).context("Failed to open table")?;
        scan_from(&table, prefix)
    }
}

/// Read-write view over one open write transaction
pub struct WriteScope {
    txn: WriteTransaction,
}

impl RecordReader for WriteScope {
    fn get_record<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> Result<Option<T>> {
        let table = self.txn.open_table(table).context("Failed to open table")?;
        get_from(&table, key)
    }

    fn scan_records<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> Result<Vec<T>> {
        let table = self.txn.open_table(table).context("Failed to open table")?;
        scan_from(&table, prefix)
    }
}

impl WriteScope {
    pub(crate) fn put_record<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).context("Failed to serialize record")?;
        let mut table = self.txn.open_table(table).context("Failed to open table")?;
        table
            .insert(key, bytes.as_slice())
            .context("Failed to insert record")?;
        Ok(())
    }

    /// Returns whether the key existed
    pub(crate) fn remove_record(&self, table: JsonTable, key: &str) -> Result<bool> {
        let mut table = self.txn.open_table(table).context("Failed to open table")?;
        let removed = table.remove(key).context("Failed to remove record")?;
        Ok(removed.is_some())
    }

    /// Next value of a monotonically increasing counter in the meta table
    pub(crate) fn next_sequence(&self, key: &str) -> Result<u64> {
        let mut meta = self
            .txn
            .open_table(META_TABLE)
            .context("Failed to open meta table")?;
        let mut current = 0;
        if let Some(value) = meta.get(key).context("Failed to read sequence")? {
            current = value.value();
        }
        let next = current + 1;
        meta.insert(key, next).context("Failed to advance sequence")?;
        Ok(next)
    }
}

impl StateWriter for WriteScope {
    fn put_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        self.put_record(WORKFLOWS_TABLE, workflow.slug.as_str(), workflow)
    }

    fn put_run(&self, run: &Run) -> Result<()> {
        self.put_record(RUNS_TABLE, &run_key(&run.id), run)
    }

    fn put_step_state(&self, state: &StepState) -> Result<()> {
        self.put_record(
            STEP_STATES_TABLE,
            &step_key(&state.run_id, &state.step_slug),
            state,
        )
    }

    fn put_task(&self, task: &Task) -> Result<()> {
        self.put_record(
            TASKS_TABLE,
            &task_key(&task.run_id, &task.step_slug, task.task_index),
            task,
        )
    }

    fn ensure_queue(&self, queue: &str) -> Result<()> {
        RedbQueue::ensure_queue_in(self, queue)
    }

    fn send_message(&self, queue: &str, message: Value, delay: Duration) -> Result<i64> {
        RedbQueue::send_in(self, queue, message, delay)
    }

    fn archive_message(&self, queue: &str, msg_id: i64) -> Result<bool> {
        RedbQueue::archive_in(self, queue, msg_id)
    }

    fn set_message_vt(&self, queue: &str, msg_id: i64, delay: Duration) -> Result<bool> {
        RedbQueue::set_vt_in(self, queue, msg_id, delay)
    }
}
