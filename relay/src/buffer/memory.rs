//! In-process [`MessageBuffer`] with the same delivery semantics as the Postgres one.
//!
//! Nothing survives the process, so this is for tests and for dry runs without a database.

use super::{
    ChatMessage, MessageBuffer, MessageId, QUEUE_NAME, QueuedMessage, deadline_after,
};
use crate::error::BufferError;
use jiff::Timestamp;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug)]
struct Entry {
    payload: ChatMessage,
    enqueued_at: Timestamp,
    /// Invisible until this point; `None` if never polled.
    visible_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct Queue {
    next_id: MessageId,
    entries: BTreeMap<MessageId, Entry>,
}

#[derive(Debug)]
pub struct MemoryBuffer {
    queue_name: String,
    queues: Mutex<BTreeMap<String, Queue>>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::with_queue(QUEUE_NAME)
    }

    pub fn with_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            queues: Mutex::new(BTreeMap::new()),
        }
    }

    /// Names of all queues created so far.
    pub async fn queue_names(&self) -> BTreeSet<String> {
        self.queues.lock().await.keys().cloned().collect()
    }
}

impl Default for MemoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer for MemoryBuffer {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn ensure_queue(&self) -> Result<(), BufferError> {
        let mut queues = self.queues.lock().await;
        if queues.contains_key(&self.queue_name) {
            tracing::info!(queue = %self.queue_name, "queue already exists");
        } else {
            tracing::info!(queue = %self.queue_name, "creating queue");
            queues.insert(self.queue_name.clone(), Queue::default());
        }
        Ok(())
    }

    async fn push(&self, payload: &ChatMessage) -> Result<MessageId, BufferError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&self.queue_name)
            .ok_or_else(|| BufferError::QueueMissing(self.queue_name.clone()))?;

        queue.next_id += 1;
        let id = queue.next_id;
        queue.entries.insert(
            id,
            Entry {
                payload: payload.clone(),
                enqueued_at: Timestamp::now(),
                visible_at: None,
            },
        );
        Ok(id)
    }

    async fn poll_batch(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueuedMessage>, BufferError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&self.queue_name)
            .ok_or_else(|| BufferError::QueueMissing(self.queue_name.clone()))?;

        let now = Timestamp::now();
        let deadline = deadline_after(now, visibility_timeout);
        let mut batch = Vec::new();
        for (&id, entry) in queue.entries.iter_mut() {
            if batch.len() >= max_count {
                break;
            }
            if entry.visible_at.is_some_and(|at| at > now) {
                continue;
            }
            entry.visible_at = Some(deadline);
            batch.push(QueuedMessage {
                id,
                payload: entry.payload.clone(),
                enqueued_at: entry.enqueued_at,
                visibility_deadline: deadline,
            });
        }
        Ok(batch)
    }

    async fn acknowledge(&self, ids: &[MessageId]) -> Result<(), BufferError> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&self.queue_name)
            .ok_or_else(|| BufferError::QueueMissing(self.queue_name.clone()))?;
        for id in ids {
            queue.entries.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64, BufferError> {
        let queues = self.queues.lock().await;
        let queue = queues
            .get(&self.queue_name)
            .ok_or_else(|| BufferError::QueueMissing(self.queue_name.clone()))?;
        Ok(queue.entries.len() as u64)
    }
}
