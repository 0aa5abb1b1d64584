// Queue workers
// Decision: one subscription per worker; the broker's consumer loop owns
// retries and dead-lettering, the worker only turns deliveries into service calls

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use menusync_core::{ParseMenuMessage, ProductStatusEvent};
use menusync_queue::{
    handler_fn, Broker, BrokerError, Delivery, Subscription, QUEUE_MENU_PARSING,
    QUEUE_PRODUCT_STATUS,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::services::{ParsingService, ProductService};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {0} is already running")]
    AlreadyRunning(&'static str),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Turns one delivery into a service call. An error fails the delivery.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, delivery: &Delivery) -> Result<(), ServiceError>;
}

/// Handles `menu-parsing` deliveries
pub struct MenuParsingDispatch {
    service: Arc<ParsingService>,
}

impl MenuParsingDispatch {
    pub fn new(service: Arc<ParsingService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Dispatch for MenuParsingDispatch {
    async fn dispatch(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let message: ParseMenuMessage = serde_json::from_slice(&delivery.payload)?;
        let task_id = Uuid::parse_str(&message.task_id)
            .map_err(|_| ServiceError::InvalidId(message.task_id.clone()))?;

        debug!(%task_id, retry_count = delivery.retry_count(), "processing parsing task");
        self.service
            .process_task(task_id, delivery.retry_count())
            .await?;
        Ok(())
    }
}

/// Handles `product-status` deliveries
pub struct ProductStatusDispatch {
    service: Arc<ProductService>,
}

impl ProductStatusDispatch {
    pub fn new(service: Arc<ProductService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Dispatch for ProductStatusDispatch {
    async fn dispatch(&self, delivery: &Delivery) -> Result<(), ServiceError> {
        let mut event: ProductStatusEvent = serde_json::from_slice(&delivery.payload)?;
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        debug!(product_id = %event.product_id, new_status = %event.new_status, "processing status event");
        self.service.process_event(&event).await?;
        Ok(())
    }
}

/// A consumer bound to one queue
pub struct Worker {
    name: &'static str,
    queue: &'static str,
    broker: Arc<dyn Broker>,
    dispatch: Arc<dyn Dispatch>,
    shutdown: CancellationToken,
    subscription: Mutex<Option<Subscription>>,
}

impl Worker {
    pub fn new(
        name: &'static str,
        queue: &'static str,
        broker: Arc<dyn Broker>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            name,
            queue,
            broker,
            dispatch,
            shutdown: CancellationToken::new(),
            subscription: Mutex::new(None),
        }
    }

    pub fn menu_parsing(broker: Arc<dyn Broker>, service: Arc<ParsingService>) -> Self {
        Self::new(
            "menu-parsing",
            QUEUE_MENU_PARSING,
            broker,
            Arc::new(MenuParsingDispatch::new(service)),
        )
    }

    pub fn product_status(broker: Arc<dyn Broker>, service: Arc<ProductService>) -> Self {
        Self::new(
            "product-status",
            QUEUE_PRODUCT_STATUS,
            broker,
            Arc::new(ProductStatusDispatch::new(service)),
        )
    }

    /// Tie the worker to a parent token; cancelling it stops the worker.
    pub fn with_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn queue(&self) -> &'static str {
        self.queue
    }

    /// Subscribe to the worker's queue
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.as_ref().is_some_and(|s| !s.is_finished()) {
            return Err(WorkerError::AlreadyRunning(self.name));
        }

        let dispatch = self.dispatch.clone();
        let worker = self.name;
        let handler = handler_fn(move |delivery: Delivery| {
            let dispatch = dispatch.clone();
            async move {
                dispatch.dispatch(&delivery).await.map_err(|e| {
                    warn!(worker, queue = %delivery.queue, error = %e, "delivery failed");
                    anyhow::Error::from(e)
                })
            }
        });

        let sub = self
            .broker
            .subscribe(self.queue, handler, self.shutdown.child_token())
            .await?;
        *subscription = Some(sub);

        info!(worker = self.name, queue = self.queue, "worker started");
        Ok(())
    }

    /// Cancel the subscription and wait for the in-flight delivery to finish.
    ///
    /// Stopping a worker that is not running is a no-op.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let Some(sub) = self.subscription.lock().await.take() else {
            return Ok(());
        };
        sub.cancel();
        sub.join().await?;
        info!(worker = self.name, "worker stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.subscription
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use menusync_queue::InMemoryBroker;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct CountingDispatch {
        seen: SyncMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Dispatch for CountingDispatch {
        async fn dispatch(&self, delivery: &Delivery) -> Result<(), ServiceError> {
            self.seen.lock().push(delivery.payload.clone());
            Ok(())
        }
    }

    async fn broker() -> Arc<InMemoryBroker> {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue(QUEUE_MENU_PARSING).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let broker = broker().await;
        let worker = Worker::new(
            "test",
            QUEUE_MENU_PARSING,
            broker,
            Arc::new(CountingDispatch::default()),
        );

        worker.start().await.unwrap();
        assert!(worker.is_running().await);
        assert!(matches!(
            worker.start().await,
            Err(WorkerError::AlreadyRunning("test"))
        ));
        worker.stop().await.unwrap();
        assert!(!worker.is_running().await);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let broker = broker().await;
        let dispatch = Arc::new(CountingDispatch::default());
        let worker = Worker::new("test", QUEUE_MENU_PARSING, broker.clone(), dispatch.clone());

        worker.start().await.unwrap();
        worker.stop().await.unwrap();
        worker.stop().await.unwrap();

        broker.publish(QUEUE_MENU_PARSING, b"{}").await.unwrap();
        worker.start().await.unwrap();
        for _ in 0..100 {
            if !dispatch.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        worker.stop().await.unwrap();
        assert_eq!(dispatch.seen.lock().as_slice(), &[b"{}".to_vec()]);
    }

    #[tokio::test]
    async fn test_parent_token_stops_worker() {
        let broker = broker().await;
        let parent = CancellationToken::new();
        let worker = Worker::new(
            "test",
            QUEUE_MENU_PARSING,
            broker,
            Arc::new(CountingDispatch::default()),
        )
        .with_shutdown(&parent);

        worker.start().await.unwrap();
        parent.cancel();
        worker.stop().await.unwrap();
        assert!(!worker.is_running().await);
    }

    #[tokio::test]
    async fn test_start_on_undeclared_queue() {
        let broker = Arc::new(InMemoryBroker::new());
        let worker = Worker::new(
            "test",
            QUEUE_PRODUCT_STATUS,
            broker,
            Arc::new(CountingDispatch::default()),
        );
        assert!(matches!(
            worker.start().await,
            Err(WorkerError::Broker(BrokerError::QueueNotDeclared(_)))
        ));
    }
}
