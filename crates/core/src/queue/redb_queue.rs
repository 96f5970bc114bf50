use super::{after, Queue, QueueMessage, ReadOptions};
use crate::store::schema::{
    message_key, queue_prefix, MESSAGE_SEQ_KEY, QUEUES_TABLE, QUEUE_ARCHIVE_TABLE,
    QUEUE_MESSAGES_TABLE,
};
use crate::store::{FlowStore, RecordReader, RedbStore, WriteScope};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueInfo {
    name: String,
    created_at: DateTime<Utc>,
}

/// A message after it has been archived
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedMessage {
    #[serde(flatten)]
    pub message: QueueMessage,
    pub archived_at: DateTime<Utc>,
}

/// Queue whose backing tables live in the same redb database as the run
/// state, so the engine can enqueue inside its own state transactions.
#[derive(Clone)]
pub struct RedbQueue {
    store: RedbStore,
    notify: Arc<Notify>,
}

impl RedbQueue {
    pub fn new(store: RedbStore) -> Self {
        let notify = store.notifier();
        Self { store, notify }
    }

    pub(crate) fn ensure_queue_in(scope: &WriteScope, queue: &str) -> Result<()> {
        if scope.get_record::<QueueInfo>(QUEUES_TABLE, queue)?.is_none() {
            tracing::info!("Creating queue {}", queue);
            scope.put_record(
                QUEUES_TABLE,
                queue,
                &QueueInfo {
                    name: queue.to_string(),
                    created_at: Utc::now(),
                },
            )?;
        }
        Ok(())
    }

    fn require_queue<R: RecordReader>(scope: &R, queue: &str) -> Result<()> {
        scope
            .get_record::<QueueInfo>(QUEUES_TABLE, queue)?
            .map(|_| ())
            .ok_or_else(|| anyhow!("Queue {} does not exist", queue))
    }

    pub(crate) fn send_in(
        scope: &WriteScope,
        queue: &str,
        message: serde_json::Value,
        delay: Duration,
    ) -> Result<i64> {
        Self::require_queue(scope, queue)?;

        let msg_id = i64::try_from(scope.next_sequence(MESSAGE_SEQ_KEY)?)?;
        let now = Utc::now();
        let record = QueueMessage {
            msg_id,
            read_ct: 0,
            enqueued_at: now,
            visible_at: if delay.is_zero() { now } else { after(delay) },
            message,
        };
        scope.put_record(QUEUE_MESSAGES_TABLE, &message_key(queue, msg_id), &record)?;
        Ok(msg_id)
    }

    /// Lease up to `max_messages` visible messages, oldest first
    pub(crate) fn read_in(
        scope: &WriteScope,
        queue: &str,
        visibility_timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>> {
        Self::require_queue(scope, queue)?;

        let now = Utc::now();
        let visible_at = after(visibility_timeout);
        let mut batch = Vec::new();

        let messages: Vec<QueueMessage> =
            scope.scan_records(QUEUE_MESSAGES_TABLE, &queue_prefix(queue))?;
        for mut msg in messages {
            if batch.len() >= max_messages {
                break;
            }
            if msg.visible_at > now {
                continue;
            }
            msg.read_ct += 1;
            msg.visible_at = visible_at;
            scope.put_record(QUEUE_MESSAGES_TABLE, &message_key(queue, msg.msg_id), &msg)?;
            batch.push(msg);
        }

        Ok(batch)
    }

    /// Whether `read_in` would return anything right now
    fn has_visible_in<R: RecordReader>(scope: &R, queue: &str) -> Result<bool> {
        Self::require_queue(scope, queue)?;

        let now = Utc::now();
        let messages: Vec<QueueMessage> =
            scope.scan_records(QUEUE_MESSAGES_TABLE, &queue_prefix(queue))?;
        Ok(messages.iter().any(|msg| msg.visible_at <= now))
    }

    pub(crate) fn archive_in(scope: &WriteScope, queue: &str, msg_id: i64) -> Result<bool> {
        let key = message_key(queue, msg_id);
        let Some(message) = scope.get_record::<QueueMessage>(QUEUE_MESSAGES_TABLE, &key)? else {
            return Ok(false);
        };
        scope.remove_record(QUEUE_MESSAGES_TABLE, &key)?;
        scope.put_record(
            QUEUE_ARCHIVE_TABLE,
            &key,
            &ArchivedMessage {
                message,
                archived_at: Utc::now(),
            },
        )?;
        Ok(true)
    }

    pub(crate) fn delete_in(scope: &WriteScope, queue: &str, msg_id: i64) -> Result<bool> {
        scope.remove_record(QUEUE_MESSAGES_TABLE, &message_key(queue, msg_id))
    }

    pub(crate) fn set_vt_in(
        scope: &WriteScope,
        queue: &str,
        msg_id: i64,
        delay: Duration,
    ) -> Result<bool> {
        let key = message_key(queue, msg_id);
        let Some(mut message) = scope.get_record::<QueueMessage>(QUEUE_MESSAGES_TABLE, &key)? else {
            return Ok(false);
        };
        message.visible_at = after(delay);
        scope.put_record(QUEUE_MESSAGES_TABLE, &key, &message)?;
        Ok(true)
    }

    /// Messages still in the queue (visible or not)
    pub fn pending(&self, queue: &str) -> Result<Vec<QueueMessage>> {
        self.store
            .read(|scope| scope.scan_records(QUEUE_MESSAGES_TABLE, &queue_prefix(queue)))
    }

    pub fn archived(&self, queue: &str) -> Result<Vec<ArchivedMessage>> {
        self.store
            .read(|scope| scope.scan_records(QUEUE_ARCHIVE_TABLE, &queue_prefix(queue)))
    }
}

#[async_trait::async_trait]
impl Queue for RedbQueue {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        self.store
            .write(|scope| Self::ensure_queue_in(scope, queue))
    }

    async fn send(
        &self,
        queue: &str,
        message: serde_json::Value,
        delay: Duration,
    ) -> Result<i64> {
        let msg_id = self
            .store
            .write(|scope| Self::send_in(scope, queue, message, delay))?;
        self.notify_waiters();
        Ok(msg_id)
    }

    async fn read_with_poll(&self, queue: &str, options: ReadOptions) -> Result<Vec<QueueMessage>> {
        let deadline = Instant::now() + options.max_poll;

        loop {
            // Register interest before checking so a send between the check
            // and the wait still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Check in a read snapshot first so an idle queue never takes the
            // write lock
            if self.store.read(|scope| Self::has_visible_in(scope, queue))? {
                let batch = self.store.write(|scope| {
                    Self::read_in(
                        scope,
                        queue,
                        options.visibility_timeout,
                        options.max_messages,
                    )
                })?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = options.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> Result<bool> {
        self.store
            .write(|scope| Self::archive_in(scope, queue, msg_id))
    }

    async fn delete(&self, queue: &str, msg_id: i64) -> Result<bool> {
        self.store
            .write(|scope| Self::delete_in(scope, queue, msg_id))
    }

    async fn set_vt(&self, queue: &str, msg_id: i64, delay: Duration) -> Result<bool> {
        self.store
            .write(|scope| Self::set_vt_in(scope, queue, msg_id, delay))
    }

    fn notify_waiters(&self) {
        self.notify.notify_waiters();
    }
}
