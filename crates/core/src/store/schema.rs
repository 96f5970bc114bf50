//! Table layout and versioned migrations for the redb state store.
//!
//! Records are stored as JSON values. Composite keys are `:`-joined strings;
//! slugs cannot contain `:`, so a `"{run_id}:"` prefix scan returns exactly one
//! run's rows. Numeric key parts are zero-padded to keep them ordered.

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use crate::types::{RunId, StepSlug};

pub(crate) const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
pub(crate) const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
pub(crate) const STEP_STATES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("step_states");
pub(crate) const TASKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
pub(crate) const QUEUES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("queues");
pub(crate) const QUEUE_MESSAGES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("queue_messages");
pub(crate) const QUEUE_ARCHIVE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("queue_archive");
pub(crate) const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub(crate) const SCHEMA_VERSION_KEY: &str = "schema_version";
pub(crate) const MESSAGE_SEQ_KEY: &str = "queue_message_seq";

struct Migration {
    version: u64,
    description: &'static str,
    apply: fn(&WriteTransaction) -> Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create workflow, run, step and task tables",
        apply: create_state_tables,
    },
    Migration {
        version: 2,
        description: "create queue tables",
        apply: create_queue_tables,
    },
];

/// Latest schema version this build knows about
pub const SCHEMA_VERSION: u64 = 2;

fn create_state_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(WORKFLOWS_TABLE)
        .context("Failed to open workflows table")?;
    txn.open_table(RUNS_TABLE)
        .context("Failed to open runs table")?;
    txn.open_table(STEP_STATES_TABLE)
        .context("Failed to open step states table")?;
    txn.open_table(TASKS_TABLE)
        .context("Failed to open tasks table")?;
    Ok(())
}

fn create_queue_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(QUEUES_TABLE)
        .context("Failed to open queues table")?;
    txn.open_table(QUEUE_MESSAGES_TABLE)
        .context("Failed to open queue messages table")?;
    txn.open_table(QUEUE_ARCHIVE_TABLE)
        .context("Failed to open queue archive table")?;
    Ok(())
}

/// Bring the database up to [`SCHEMA_VERSION`]. Safe to call on every open.
pub(crate) fn migrate(db: &Database) -> Result<u64> {
    let write_txn = db.begin_write().context("Failed to begin write transaction")?;
    let mut current = 0;
    {
        let meta = write_txn
            .open_table(META_TABLE)
            .context("Failed to open meta table")?;
        if let Some(version) = meta
            .get(SCHEMA_VERSION_KEY)
            .context("Failed to read schema version")?
        {
            current = version.value();
        };
    }

    if current > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}",
            current,
            SCHEMA_VERSION
        );
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            "Applying store migration {}: {}",
            migration.version,
            migration.description
        );
        (migration.apply)(&write_txn)?;
    }

    {
        let mut meta = write_txn
            .open_table(META_TABLE)
            .context("Failed to open meta table")?;
        meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)
            .context("Failed to record schema version")?;
    }
    write_txn.commit().context("Failed to commit migrations")?;

    Ok(SCHEMA_VERSION)
}

pub(crate) fn run_key(run_id: &RunId) -> String {
    run_id.to_string()
}

pub(crate) fn run_prefix(run_id: &RunId) -> String {
    format!("{}:", run_id)
}

pub(crate) fn step_key(run_id: &RunId, step: &StepSlug) -> String {
    format!("{}:{}", run_id, step)
}

pub(crate) fn step_task_prefix(run_id: &RunId, step: &StepSlug) -> String {
    format!("{}:{}:", run_id, step)
}

pub(crate) fn task_key(run_id: &RunId, step: &StepSlug, task_index: u32) -> String {
    format!("{}:{}:{:010}", run_id, step, task_index)
}

pub(crate) fn queue_prefix(queue: &str) -> String {
    format!("{}:", queue)
}

pub(crate) fn message_key(queue: &str, msg_id: i64) -> String {
    format!("{}:{:020}", queue, msg_id)
}
