//! Transport independent consumption loop with retry and dead-lettering

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::MessageHandler;
use crate::clock::Clock;
use crate::error::BrokerError;
use crate::message::{
    dead_letter_queue, Delivery, OutboundMessage, ERROR_HEADER, ORIGINAL_QUEUE_HEADER,
    RETRY_COUNT_HEADER,
};
use crate::retry::{duration_millis, RetryPolicy};

/// Consumer configuration shared by all subscriptions of a broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    /// Redelivery policy for failed handler invocations
    pub retry: RetryPolicy,

    /// Maximum deliveries claimed per receive
    pub prefetch_count: usize,

    /// How long a receive waits for new messages before polling again
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            prefetch_count: 10,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl ConsumerConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: usize) -> Self {
        self.prefetch_count = prefetch_count.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Minimal operations a storage backend provides to the consumer
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Claim up to `max` deliveries, waiting at most `wait` when the queue is empty
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Enqueue a message on behalf of the consumer (retries and dead letters)
    async fn send(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError>;
}

/// Runs a handler over one queue and decides the fate of every delivery
pub struct RetryingConsumer<T: Transport> {
    transport: Arc<T>,
    queue: String,
    handler: MessageHandler,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
}

impl<T: Transport> RetryingConsumer<T> {
    pub fn new(
        transport: Arc<T>,
        queue: impl Into<String>,
        handler: MessageHandler,
        clock: Arc<dyn Clock>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            transport,
            queue: queue.into(),
            handler,
            clock,
            config,
        }
    }

    /// Consume until `cancel` fires or the transport reports it is closed.
    ///
    /// Cancellation is only observed between receives, so a claimed batch is
    /// always processed to the end.
    pub async fn run(self, cancel: CancellationToken) {
        info!(queue = %self.queue, prefetch = self.config.prefetch_count, "consumer started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.transport.receive(
                    &self.queue,
                    self.config.prefetch_count,
                    self.config.poll_interval,
                ) => received,
            };

            match received {
                Ok(batch) => {
                    for delivery in batch {
                        self.process(delivery).await;
                    }
                }
                Err(BrokerError::Closed) => {
                    debug!(queue = %self.queue, "transport closed");
                    break;
                }
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!(queue = %self.queue, "consumer stopped");
    }

    /// Run the handler for one delivery, then retry or dead-letter on failure, then ack
    pub async fn process(&self, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        let retry_count = delivery.retry_count();

        match (self.handler)(delivery.clone()).await {
            Ok(()) => {
                debug!(queue = %self.queue, delivery_tag = tag, retry_count, "delivery handled");
            }
            Err(err) => {
                let reason = format!("{err:#}");
                if self.config.retry.has_retries_remaining(retry_count) {
                    self.retry(&delivery, retry_count, &reason).await;
                } else {
                    self.dead_letter(&delivery, retry_count, &reason).await;
                }
            }
        }

        if let Err(e) = self.transport.ack(&delivery).await {
            error!(queue = %self.queue, delivery_tag = tag, error = %e, "failed to ack delivery");
        }
    }

    async fn retry(&self, delivery: &Delivery, retry_count: u32, reason: &str) {
        let delay = self.config.retry.delay_for_retry(retry_count);
        warn!(
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "handler failed, scheduling retry"
        );

        self.clock.sleep(delay).await;

        let message = OutboundMessage::new(delivery.payload.clone())
            .with_content_type(delivery.content_type.clone())
            .with_header(RETRY_COUNT_HEADER, retry_count + 1);

        if let Err(e) = self.transport.send(&self.queue, message).await {
            error!(queue = %self.queue, error = %e, "failed to republish delivery for retry");
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, retry_count: u32, reason: &str) {
        let dlq = dead_letter_queue(&self.queue);
        error!(
            queue = %self.queue,
            dlq = %dlq,
            delivery_tag = delivery.delivery_tag,
            retry_count,
            error = %reason,
            "retries exhausted, dead-lettering delivery"
        );

        let message = OutboundMessage::new(delivery.payload.clone())
            .with_content_type(delivery.content_type.clone())
            .with_header(ORIGINAL_QUEUE_HEADER, self.queue.clone())
            .with_header(RETRY_COUNT_HEADER, retry_count)
            .with_header(ERROR_HEADER, reason.to_string());

        if let Err(e) = self.transport.send(&dlq, message).await {
            error!(queue = %self.queue, dlq = %dlq, error = %e, "failed to publish to dead-letter queue");
        }
    }
}
