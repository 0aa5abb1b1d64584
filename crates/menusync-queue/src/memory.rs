//! In-memory broker for tests and single-process deployments

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{Broker, MessageHandler, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::consumer::{ConsumerConfig, RetryingConsumer, Transport};
use crate::error::BrokerError;
use crate::message::{Delivery, OutboundMessage};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    unacked: HashMap<u64, Delivery>,
    published: u64,
    notify: Arc<Notify>,
}

/// Queue storage shared between the broker handle and its consumer loops
struct MemoryTransport {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn enqueue(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotDeclared(queue.to_string()))?;

        state.ready.push_back(Delivery {
            delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst),
            queue: queue.to_string(),
            payload: message.payload,
            headers: message.headers,
            content_type: message.content_type,
            published_at: Utc::now(),
        });
        state.published += 1;
        state.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let notify = {
            if self.is_closed() {
                return Err(BrokerError::Closed);
            }
            let mut queues = self.queues.lock();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotDeclared(queue.to_string()))?;

            if !state.ready.is_empty() {
                let take = max.max(1).min(state.ready.len());
                let batch: Vec<Delivery> = state.ready.drain(..take).collect();
                for delivery in &batch {
                    state.unacked.insert(delivery.delivery_tag, delivery.clone());
                }
                return Ok(batch);
            }
            state.notify.clone()
        };

        // An empty batch sends the consumer straight back here, which picks
        // up whatever arrived while waiting.
        let _ = tokio::time::timeout(wait, notify.notified()).await;
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(Vec::new())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(&delivery.queue) {
            state.unacked.remove(&delivery.delivery_tag);
        }
        Ok(())
    }

    async fn send(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        self.enqueue(queue, message)
    }
}

/// Process-local broker
///
/// Queues live as long as the broker. Useful for tests: publish failures can
/// be injected and queue contents inspected.
///
/// # Example
///
/// ```
/// use menusync_queue::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// assert_eq!(broker.depth("menu-parsing"), 0);
/// ```
pub struct InMemoryBroker {
    transport: Arc<MemoryTransport>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
    subscribed: Arc<Mutex<HashSet<String>>>,
    publish_failure: Mutex<Option<String>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(ConsumerConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_config(config: ConsumerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport: Arc::new(MemoryTransport::new()),
            clock,
            config,
            subscribed: Arc::new(Mutex::new(HashSet::new())),
            publish_failure: Mutex::new(None),
        }
    }

    /// Make every following `publish` fail with a transport error until cleared
    pub fn fail_publishes(&self, reason: impl Into<String>) {
        *self.publish_failure.lock() = Some(reason.into());
    }

    pub fn clear_publish_failure(&self) {
        *self.publish_failure.lock() = None;
    }

    /// Messages waiting in `queue` (not yet delivered)
    pub fn messages(&self, queue: &str) -> Vec<Delivery> {
        self.transport
            .queues
            .lock()
            .get(queue)
            .map(|s| s.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting in `queue`
    pub fn depth(&self, queue: &str) -> usize {
        self.transport
            .queues
            .lock()
            .get(queue)
            .map(|s| s.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries handed to a consumer and not acknowledged yet
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.transport
            .queues
            .lock()
            .get(queue)
            .map(|s| s.unacked.len())
            .unwrap_or(0)
    }

    /// Total messages ever enqueued on `queue`, retries included
    pub fn published_count(&self, queue: &str) -> u64 {
        self.transport
            .queues
            .lock()
            .get(queue)
            .map(|s| s.published)
            .unwrap_or(0)
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.transport.queues.lock().contains_key(queue)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        if self.transport.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.transport
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
        debug!(%queue, "declared queue");
        Ok(())
    }

    async fn publish_message(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        if let Some(reason) = self.publish_failure.lock().clone() {
            return Err(BrokerError::Transport(reason));
        }
        self.transport.enqueue(queue, message)
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<Subscription, BrokerError> {
        if self.transport.is_closed() {
            return Err(BrokerError::Closed);
        }
        if !self.is_declared(queue) {
            return Err(BrokerError::QueueNotDeclared(queue.to_string()));
        }
        if !self.subscribed.lock().insert(queue.to_string()) {
            return Err(BrokerError::AlreadySubscribed(queue.to_string()));
        }

        let consumer = RetryingConsumer::new(
            self.transport.clone(),
            queue,
            handler,
            self.clock.clone(),
            self.config.clone(),
        );
        let subscribed = self.subscribed.clone();
        let name = queue.to_string();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            consumer.run(run_cancel).await;
            subscribed.lock().remove(&name);
        });

        info!(%queue, "subscribed");
        Ok(Subscription::new(queue.to_string(), cancel, handle))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.transport.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for state in self.transport.queues.lock().values() {
            state.notify.notify_waiters();
        }
        info!("in-memory broker closed");
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        !self.transport.is_closed()
    }
}
