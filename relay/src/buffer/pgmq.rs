//! [`MessageBuffer`] backed by the `pgmq` Postgres extension.
//!
//! The database needs the extension installed (`CREATE EXTENSION pgmq;`), for example via the
//! `quay.io/tembo/pg16-pgmq` image. Queue contents survive process restarts.

use super::{ChatMessage, MessageBuffer, MessageId, QUEUE_NAME, QueuedMessage};
use crate::error::BufferError;
use jiff::Timestamp;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PgmqBuffer {
    pool: PgPool,
    queue_name: String,
}

impl PgmqBuffer {
    /// Connects to `database_url` and operates on the default `messages` queue.
    pub async fn connect(database_url: &str) -> Result<Self, BufferError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::with_pool(pool, QUEUE_NAME))
    }

    pub fn with_pool(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    /// Names of all queues in the database.
    pub async fn list_queues(&self) -> Result<Vec<String>, BufferError> {
        let names = sqlx::query_scalar::<_, String>("SELECT queue_name FROM pgmq.list_queues()")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }
}

fn timestamp_from_micros(micros: i64) -> Result<Timestamp, BufferError> {
    Timestamp::from_microsecond(micros).map_err(|e| BufferError::Decode(e.to_string()))
}

impl MessageBuffer for PgmqBuffer {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn ensure_queue(&self) -> Result<(), BufferError> {
        if self.list_queues().await?.contains(&self.queue_name) {
            tracing::info!(queue = %self.queue_name, "queue already exists");
            return Ok(());
        }
        tracing::info!(queue = %self.queue_name, "creating queue");
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&self.queue_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn push(&self, payload: &ChatMessage) -> Result<MessageId, BufferError> {
        let id = sqlx::query_scalar::<_, i64>("SELECT * FROM pgmq.send($1, $2)")
            .bind(&self.queue_name)
            .bind(Json(payload))
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn poll_batch(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueuedMessage>, BufferError> {
        let vt = visibility_seconds(visibility_timeout);
        let qty = i32::try_from(max_count).unwrap_or(i32::MAX);

        // timestamps come back as microseconds so they can go straight into jiff
        let rows = sqlx::query(
            r#"
            SELECT msg_id,
                   (extract(epoch FROM enqueued_at) * 1000000)::bigint AS enqueued_us,
                   (extract(epoch FROM vt) * 1000000)::bigint AS vt_us,
                   message
            FROM pgmq.read($1, $2, $3)
            ORDER BY msg_id
            "#,
        )
        .bind(&self.queue_name)
        .bind(vt)
        .bind(qty)
        .fetch_all(&self.pool)
        .await?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("msg_id")?;
            let Json(payload): Json<ChatMessage> = row.try_get("message")?;
            let enqueued_at = timestamp_from_micros(row.try_get("enqueued_us")?)?;
            let visibility_deadline = timestamp_from_micros(row.try_get("vt_us")?)?;
            tracing::debug!(id, %enqueued_at, ?payload, "read message");
            batch.push(QueuedMessage {
                id,
                payload,
                enqueued_at,
                visibility_deadline,
            });
        }
        Ok(batch)
    }

    async fn acknowledge(&self, ids: &[MessageId]) -> Result<(), BufferError> {
        if ids.is_empty() {
            return Ok(());
        }
        let deleted = sqlx::query_scalar::<_, i64>("SELECT * FROM pgmq.delete($1, $2)")
            .bind(&self.queue_name)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        if deleted.len() != ids.len() {
            tracing::debug!(
                requested = ids.len(),
                deleted = deleted.len(),
                "some acknowledged messages were already gone"
            );
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64, BufferError> {
        let length = sqlx::query_scalar::<_, i64>("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(&self.queue_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(length).unwrap_or(0))
    }
}

/// `pgmq.read` takes whole seconds. Partial seconds round up so a short timeout never becomes
/// zero, which would hand the same messages straight back to the next read.
fn visibility_seconds(timeout: Duration) -> i32 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    //! These run against a real `pgmq` database when `DATABASE_URL` is set, and are skipped
    //! otherwise.

    use super::*;
    use pretty_assertions::assert_eq;

    async fn buffer(queue: &str) -> Option<PgmqBuffer> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("connect to DATABASE_URL");
        // start from an empty queue
        let _ = sqlx::query("SELECT pgmq.drop_queue($1)")
            .bind(queue)
            .execute(&pool)
            .await;
        Some(PgmqBuffer::with_pool(pool, queue))
    }

    fn msg(sender: &str, message: &str) -> ChatMessage {
        ChatMessage {
            sender: sender.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn visibility_timeout_rounds_up_to_whole_seconds() {
        assert_eq!(visibility_seconds(Duration::ZERO), 0);
        assert_eq!(visibility_seconds(Duration::from_millis(1)), 1);
        assert_eq!(visibility_seconds(Duration::from_millis(500)), 1);
        assert_eq!(visibility_seconds(Duration::from_secs(30)), 30);
        assert_eq!(visibility_seconds(Duration::from_millis(30_001)), 31);
        assert_eq!(visibility_seconds(Duration::MAX), i32::MAX);
    }

    #[tokio::test]
    async fn push_poll_acknowledge() {
        let Some(buffer) = buffer("relay_test_roundtrip").await else {
            return;
        };
        buffer.ensure_queue().await.unwrap();
        buffer.ensure_queue().await.unwrap();
        let queues = buffer.list_queues().await.unwrap();
        assert_eq!(
            queues.iter().filter(|q| *q == "relay_test_roundtrip").count(),
            1
        );

        buffer.push(&msg("alice", "hi")).await.unwrap();
        buffer.push(&msg("bob", "yo")).await.unwrap();
        assert_eq!(buffer.count().await.unwrap(), 2);

        let batch = buffer
            .poll_batch(10, Duration::from_secs(60))
            .await
            .unwrap();
        let payloads: Vec<_> = batch.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![msg("alice", "hi"), msg("bob", "yo")]);

        let ids: Vec<_> = batch.iter().map(|m| m.id).collect();
        buffer.acknowledge(&ids).await.unwrap();
        assert!(buffer.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn expired_visibility_redelivers() {
        let Some(buffer) = buffer("relay_test_redelivery").await else {
            return;
        };
        buffer.ensure_queue().await.unwrap();
        let id = buffer.push(&msg("alice", "hi")).await.unwrap();

        let first = buffer.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        let again = buffer.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(again.iter().map(|m| m.id).collect::<Vec<_>>(), vec![id]);
    }
}
