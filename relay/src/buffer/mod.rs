//! Durable buffer between the realtime channel and downstream consumers.
//!
//! Delivery is at-least-once: [`MessageBuffer::poll_batch`] hides returned messages for a
//! visibility timeout, and anything not [acknowledged](MessageBuffer::acknowledge) before the
//! timeout runs out becomes visible again. Consumers must therefore tolerate duplicates, and
//! ordering is not guaranteed across redeliveries.
//!
//! Implementations own their synchronization: every operation is atomic and callable from any
//! number of tasks at once.

use crate::error::BufferError;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

pub mod memory;
pub mod pgmq;

pub use memory::MemoryBuffer;
pub use pgmq::PgmqBuffer;

/// Name of the queue chat messages are relayed through. Stable across runs.
pub const QUEUE_NAME: &str = "messages";

/// Identifier assigned by the buffer on push.
pub type MessageId = i64;

/// The payload relayed for each chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub message: String,
}

/// A message handed out by [`MessageBuffer::poll_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub payload: ChatMessage,
    pub enqueued_at: Timestamp,
    /// The message becomes visible to other consumers again at this point unless acknowledged.
    pub visibility_deadline: Timestamp,
}

pub trait MessageBuffer: Send + Sync + 'static {
    /// Name of the queue this buffer operates on.
    fn queue_name(&self) -> &str;

    /// Creates the queue if it does not exist yet. Calling this again is a no-op.
    fn ensure_queue(&self) -> impl Future<Output = Result<(), BufferError>> + Send;

    /// Durably enqueues `payload` and returns its identifier.
    fn push(
        &self,
        payload: &ChatMessage,
    ) -> impl Future<Output = Result<MessageId, BufferError>> + Send;

    /// Returns up to `max_count` visible messages and hides them for `visibility_timeout`.
    fn poll_batch(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> impl Future<Output = Result<Vec<QueuedMessage>, BufferError>> + Send;

    /// Permanently removes fully processed messages.
    fn acknowledge(
        &self,
        ids: &[MessageId],
    ) -> impl Future<Output = Result<(), BufferError>> + Send;

    /// Number of messages not yet acknowledged, whether currently visible or not.
    fn count(&self) -> impl Future<Output = Result<u64, BufferError>> + Send;

    fn is_empty(&self) -> impl Future<Output = Result<bool, BufferError>> + Send {
        async move { Ok(self.count().await? == 0) }
    }
}

/// Adds `timeout` to `now`, saturating at the largest representable timestamp.
pub(crate) fn deadline_after(now: Timestamp, timeout: Duration) -> Timestamp {
    now.checked_add(timeout).unwrap_or(Timestamp::MAX)
}
