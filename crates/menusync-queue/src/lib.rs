//! # menusync queue
//!
//! Durable queues with at-least-once delivery, exponential-backoff retries
//! and dead-lettering.
//!
//! ```text
//!   publish ──▶ queue ──▶ RetryingConsumer ──▶ handler
//!                 ▲             │
//!                 │   failure,  │ retries exhausted
//!                 └─ retries ◀──┴──────────▶ <queue>-dlq
//!                    remaining
//! ```
//!
//! A failed delivery carrying `x-retry-count = n` is republished after
//! `2^n` delay units with `x-retry-count = n + 1`. Once `n` reaches the
//! policy's `max_retries` the payload goes to `<queue>-dlq` with
//! `x-original-queue`, `x-retry-count` and `x-error` headers. The original
//! delivery is acknowledged in every case.
//!
//! Two transports are provided: [`InMemoryBroker`] and [`PostgresBroker`].

pub mod broker;
pub mod clock;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod retry;

pub use broker::{
    declare_well_known_queues, handler_fn, Broker, HandlerResult, MessageHandler, Subscription,
};
pub use clock::{Clock, RecordingClock, SystemClock};
pub use consumer::{ConsumerConfig, RetryingConsumer, Transport};
pub use error::BrokerError;
pub use memory::InMemoryBroker;
pub use message::{
    dead_letter_queue, Delivery, Headers, OutboundMessage, CONTENT_TYPE_JSON, ERROR_HEADER,
    ORIGINAL_QUEUE_HEADER, QUEUE_MENU_PARSING, QUEUE_MENU_PARSING_DLQ, QUEUE_PRODUCT_STATUS,
    QUEUE_PRODUCT_STATUS_DLQ, RETRY_COUNT_HEADER, WELL_KNOWN_QUEUES,
};
pub use postgres::{PostgresBroker, DEFAULT_VISIBILITY_TIMEOUT};
pub use retry::RetryPolicy;
