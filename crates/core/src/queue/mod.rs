//! Durable message queue used only to signal task readiness.
//!
//! Semantics follow the pgmq model: at-least-once delivery, a per-message
//! visibility timeout set on read, a read counter, and explicit
//! archive/delete. Payloads are small JSON values; the engine only ever sends
//! a task id triple.

pub mod redb_queue;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use redb_queue::RedbQueue;

/// A message as delivered to a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub msg_id: i64,
    /// How many times this message has been delivered, this one included
    pub read_ct: u32,
    pub enqueued_at: DateTime<Utc>,
    /// The message stays hidden from readers until this instant
    pub visible_at: DateTime<Utc>,
    pub message: serde_json::Value,
}

/// Parameters for a blocking read
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Visibility timeout applied to every message returned
    pub visibility_timeout: Duration,
    pub max_messages: usize,
    /// Give up and return an empty batch after this long
    pub max_poll: Duration,
    pub poll_interval: Duration,
}

/// Queue adapter interface
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Create the queue if it does not exist
    async fn create_queue(&self, queue: &str) -> Result<()>;

    /// Enqueue a message, hidden for `delay`
    async fn send(
        &self,
        queue: &str,
        message: serde_json::Value,
        delay: Duration,
    ) -> Result<i64>;

    /// Wait up to `max_poll` for visible messages and lease them.
    /// Returns an empty batch on timeout.
    async fn read_with_poll(&self, queue: &str, options: ReadOptions) -> Result<Vec<QueueMessage>>;

    /// Move a message to the archive. Returns whether it was present.
    async fn archive(&self, queue: &str, msg_id: i64) -> Result<bool>;

    /// Drop a message without archiving it
    async fn delete(&self, queue: &str, msg_id: i64) -> Result<bool>;

    /// Hide a message until `delay` from now
    async fn set_vt(&self, queue: &str, msg_id: i64, delay: Duration) -> Result<bool>;

    /// Called after a store transaction that sent messages has committed.
    /// Backends that wake their own readers can ignore it.
    fn notify_waiters(&self) {}
}

/// `now + delay`, with the delay clamped to a century so the timestamp stays
/// in a range that round-trips through stored JSON
pub(crate) fn after(delay: Duration) -> DateTime<Utc> {
    let max = chrono::Duration::days(36_500);
    let delay = chrono::Duration::from_std(delay).unwrap_or(max).min(max);
    Utc::now() + delay
}
