//! PostgreSQL backed broker
//!
//! Messages are rows in `queue_messages`. Consumers claim batches with
//! `FOR UPDATE SKIP LOCKED`, so several processes can consume one queue
//! without contention. A claimed row is deleted on ack; rows claimed longer
//! than the visibility timeout ago (crashed consumer) become claimable again.
//!
//! Tables are created by the `menusync-storage` migrations.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::broker::{Broker, MessageHandler, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::consumer::{ConsumerConfig, RetryingConsumer, Transport};
use crate::error::BrokerError;
use crate::message::{Delivery, Headers, OutboundMessage};

/// Default time after which an unacknowledged claim is handed out again
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

struct PgTransport {
    pool: PgPool,
    consumer_id: String,
    visibility_timeout: Duration,
    // Held for reading by every statement and for writing by close(), so a
    // publish never races pool teardown.
    closed: RwLock<bool>,
}

impl PgTransport {
    async fn insert(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(BrokerError::Closed);
        }

        let headers = serde_json::to_value(&message.headers)?;
        let result = sqlx::query(
            r#"
            INSERT INTO queue_messages (queue_name, payload, headers, content_type)
            SELECT $1, $2, $3, $4
            WHERE EXISTS (SELECT 1 FROM message_queues WHERE name = $1)
            "#,
        )
        .bind(queue)
        .bind(&message.payload)
        .bind(&headers)
        .bind(&message.content_type)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to publish message: {}", e);
            BrokerError::from(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::QueueNotDeclared(queue.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for PgTransport {
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let rows = {
            let closed = self.closed.read().await;
            if *closed {
                return Err(BrokerError::Closed);
            }

            sqlx::query(
                r#"
                WITH claimable AS (
                    SELECT id
                    FROM queue_messages
                    WHERE queue_name = $1
                      AND (claimed_at IS NULL
                           OR claimed_at < NOW() - make_interval(secs => $3))
                    ORDER BY id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE queue_messages m
                SET claimed_by = $4,
                    claimed_at = NOW(),
                    delivery_count = delivery_count + 1
                FROM claimable c
                WHERE m.id = c.id
                RETURNING m.id, m.queue_name, m.payload, m.headers, m.content_type, m.published_at
                "#,
            )
            .bind(queue)
            .bind(max.max(1) as i64)
            .bind(self.visibility_timeout.as_secs_f64())
            .bind(&self.consumer_id)
            .fetch_all(&self.pool)
            .await?
        };

        if rows.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(Vec::new());
        }

        let mut deliveries = rows
            .into_iter()
            .map(|row| {
                let id: i64 = row.get("id");
                let headers: serde_json::Value = row.get("headers");
                let headers: Headers = serde_json::from_value(headers)?;
                let published_at: DateTime<Utc> = row.get("published_at");
                Ok(Delivery {
                    delivery_tag: id as u64,
                    queue: row.get("queue_name"),
                    payload: row.get("payload"),
                    headers,
                    content_type: row.get("content_type"),
                    published_at,
                })
            })
            .collect::<Result<Vec<_>, BrokerError>>()?;
        deliveries.sort_by_key(|d| d.delivery_tag);

        debug!(%queue, count = deliveries.len(), "claimed deliveries");
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(BrokerError::Closed);
        }

        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(delivery.delivery_tag as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn send(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        self.insert(queue, message).await
    }
}

/// Broker storing queues in PostgreSQL
///
/// # Example
///
/// ```ignore
/// use menusync_queue::{ConsumerConfig, PostgresBroker};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/menusync").await?;
/// let broker = PostgresBroker::new(pool, ConsumerConfig::default());
/// broker.declare_queue("menu-parsing").await?;
/// ```
pub struct PostgresBroker {
    transport: Arc<PgTransport>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
    subscribed: Arc<Mutex<HashSet<String>>>,
}

impl PostgresBroker {
    pub fn new(pool: PgPool, config: ConsumerConfig) -> Self {
        Self::with_clock(pool, config, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, config: ConsumerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport: Arc::new(PgTransport {
                pool,
                consumer_id: format!("consumer-{}", Uuid::now_v7()),
                visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
                closed: RwLock::new(false),
            }),
            clock,
            config,
            subscribed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Override how long a claimed but unacknowledged message stays invisible.
    ///
    /// Must be called before the broker is shared.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        if let Some(transport) = Arc::get_mut(&mut self.transport) {
            transport.visibility_timeout = timeout;
        }
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.transport.pool
    }

    pub fn consumer_id(&self) -> &str {
        &self.transport.consumer_id
    }

    /// Number of messages stored for `queue`, claimed or not
    #[instrument(skip(self))]
    pub async fn depth(&self, queue: &str) -> Result<i64, BrokerError> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM queue_messages WHERE queue_name = $1")
            .bind(queue)
            .fetch_one(&self.transport.pool)
            .await?;
        Ok(row.get("depth"))
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, BrokerError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM message_queues WHERE name = $1) AS found")
            .bind(queue)
            .fetch_one(&self.transport.pool)
            .await?;
        Ok(row.get("found"))
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    #[instrument(skip(self))]
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let closed = self.transport.closed.read().await;
        if *closed {
            return Err(BrokerError::Closed);
        }

        sqlx::query(
            r#"
            INSERT INTO message_queues (name, durable)
            VALUES ($1, TRUE)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(queue)
        .execute(&self.transport.pool)
        .await
        .map_err(|e| {
            error!("Failed to declare queue: {}", e);
            BrokerError::from(e)
        })?;

        debug!(%queue, "declared queue");
        Ok(())
    }

    #[instrument(skip(self, message), fields(bytes = message.payload.len()))]
    async fn publish_message(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        self.transport.insert(queue, message).await
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<Subscription, BrokerError> {
        if *self.transport.closed.read().await {
            return Err(BrokerError::Closed);
        }
        if !self.queue_exists(queue).await? {
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

        info!(%queue, consumer_id = %self.transport.consumer_id, "subscribed");
        Ok(Subscription::new(queue.to_string(), cancel, handle))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut closed = self.transport.closed.write().await;
        if *closed {
            return Ok(());
        }
        *closed = true;
        info!(consumer_id = %self.transport.consumer_id, "postgres broker closed");
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        if *self.transport.closed.read().await {
            return false;
        }
        sqlx::query("SELECT 1")
            .execute(&self.transport.pool)
            .await
            .is_ok()
    }
}
