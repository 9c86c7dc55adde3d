use crate::background::stop_requested;
use crate::buffer::{MessageBuffer, QueuedMessage};
use crate::error::BufferError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Batch size, visibility timeout, and interval of the background drain.
///
/// The defaults leave a full batch plenty of time to be processed and acknowledged within its
/// visibility window. If the consumer dies mid-batch, the batch is redelivered after the
/// visibility timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub visibility_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 10,
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// Downstream consumer of relayed messages.
///
/// A message is acknowledged only if `handle` returns `Ok`; otherwise it is redelivered once its
/// visibility timeout runs out, so handlers must tolerate seeing a message more than once.
pub trait MessageHandler: Send + 'static {
    fn handle(&mut self, message: &QueuedMessage) -> eyre::Result<()>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&QueuedMessage) -> eyre::Result<()> + Send + 'static,
{
    fn handle(&mut self, message: &QueuedMessage) -> eyre::Result<()> {
        self(message)
    }
}

/// Baseline consumer: logs every message and accepts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl MessageHandler for LogHandler {
    fn handle(&mut self, message: &QueuedMessage) -> eyre::Result<()> {
        tracing::info!(
            id = message.id,
            enqueued_at = %message.enqueued_at,
            sender = %message.payload.sender,
            message = %message.payload.message,
            "processing message"
        );
        Ok(())
    }
}

/// Periodically drains a [`MessageBuffer`] into a [`MessageHandler`].
pub struct Poller<B, H> {
    buffer: Arc<B>,
    config: PollerConfig,
    handler: H,
}

impl<B, H> Poller<B, H>
where
    B: MessageBuffer,
    H: MessageHandler,
{
    pub fn new(buffer: Arc<B>, config: PollerConfig, handler: H) -> Self {
        Self {
            buffer,
            config,
            handler,
        }
    }

    /// Polls one batch, hands it to the handler, and acknowledges what was handled.
    ///
    /// Returns the number of acknowledged messages.
    pub async fn poll_once(&mut self) -> Result<usize, BufferError> {
        let batch = self
            .buffer
            .poll_batch(self.config.batch_size, self.config.visibility_timeout)
            .await?;
        if batch.is_empty() {
            tracing::trace!("no messages to process");
            return Ok(0);
        }

        let mut handled = Vec::with_capacity(batch.len());
        for message in &batch {
            match self.handler.handle(message) {
                Ok(()) => handled.push(message.id),
                Err(e) => tracing::warn!(
                    id = message.id,
                    error = %e,
                    "handler failed, message will be redelivered"
                ),
            }
        }

        self.buffer.acknowledge(&handled).await?;
        tracing::debug!(
            polled = batch.len(),
            acknowledged = handled.len(),
            "processed batch"
        );
        Ok(handled.len())
    }

    /// Polls every interval until `stop` is set.
    ///
    /// A stop request never interrupts an iteration that has already started.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            queue = self.buffer.queue_name(),
            ?period,
            batch_size = self.config.batch_size,
            "poller started"
        );
        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(error = %e, "failed to drain message buffer");
                    }
                }
            }
        }
        tracing::info!("poller stopped");
    }

    pub fn spawn(self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }
}
