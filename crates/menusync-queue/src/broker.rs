//! Broker contract shared by every transport

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::BrokerError;
use crate::message::{Delivery, OutboundMessage, WELL_KNOWN_QUEUES};

/// Result of one handler invocation; an error triggers retry or dead-lettering
pub type HandlerResult = Result<(), anyhow::Error>;

/// Handler invoked once per delivery
pub type MessageHandler =
    Arc<dyn Fn(Delivery) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |delivery| Box::pin(handler(delivery)))
}

/// Durable message broker
///
/// Every delivery is acknowledged exactly once by the subscription loop:
/// after the handler succeeds, after a failed delivery was republished for a
/// retry, or after it was rerouted to its dead-letter queue.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Idempotently create a durable queue
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a persistent JSON message without headers
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.publish_message(queue, OutboundMessage::new(payload.to_vec()))
            .await
    }

    async fn publish_message(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue` until `cancel` fires or the broker closes.
    ///
    /// Only one subscription per queue is allowed on a broker instance.
    async fn subscribe(
        &self,
        queue: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<Subscription, BrokerError>;

    /// Release transport resources. Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;

    async fn is_reachable(&self) -> bool;
}

/// Declare the work queues and their dead-letter queues
pub async fn declare_well_known_queues(broker: &dyn Broker) -> Result<(), BrokerError> {
    for queue in WELL_KNOWN_QUEUES {
        broker.declare_queue(queue).await?;
    }
    info!(queues = ?WELL_KNOWN_QUEUES, "declared queues");
    Ok(())
}

/// Handle to a running consumption loop
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(queue: String, cancel: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            queue,
            cancel,
            handle,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Ask the loop to stop at its next receive boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit; the in-flight delivery, if any, completes first
    pub async fn join(self) -> Result<(), BrokerError> {
        self.handle
            .await
            .map_err(|e| BrokerError::transport(format!("consumer task for {} failed: {e}", self.queue)))
    }
}
