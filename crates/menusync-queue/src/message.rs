//! Queue names, headers and message types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const QUEUE_MENU_PARSING: &str = "menu-parsing";
pub const QUEUE_PRODUCT_STATUS: &str = "product-status";
pub const QUEUE_MENU_PARSING_DLQ: &str = "menu-parsing-dlq";
pub const QUEUE_PRODUCT_STATUS_DLQ: &str = "product-status-dlq";

/// Queues declared at startup
pub const WELL_KNOWN_QUEUES: [&str; 4] = [
    QUEUE_MENU_PARSING,
    QUEUE_PRODUCT_STATUS,
    QUEUE_MENU_PARSING_DLQ,
    QUEUE_PRODUCT_STATUS_DLQ,
];

/// Number of times a delivery has already been retried
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Queue a dead-lettered message was consumed from
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";
/// Handler error that sent a message to the dead-letter queue
pub const ERROR_HEADER: &str = "x-error";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Message headers
pub type Headers = BTreeMap<String, Value>;

/// Name of the dead-letter queue paired with `queue`
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}-dlq")
}

/// A message to publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: Headers,
    pub content_type: String,
}

impl OutboundMessage {
    /// A JSON message without headers
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            headers: Headers::new(),
            content_type: CONTENT_TYPE_JSON.to_string(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// A message handed to a subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Transport specific id used to acknowledge the delivery
    pub delivery_tag: u64,
    pub queue: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: Headers,
    pub content_type: String,
    pub published_at: DateTime<Utc>,
}

impl Delivery {
    /// Value of the retry count header, 0 when absent or malformed
    pub fn retry_count(&self) -> u32 {
        self.header_u32(RETRY_COUNT_HEADER).unwrap_or(0)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(Value::as_str)
    }

    pub fn header_u32(&self, name: &str) -> Option<u32> {
        self.headers
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }
}
