//! Queue message envelopes and audit records
//!
//! Field names of the envelopes are part of the wire contract between
//! publishers and workers and must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::menu::ProductStatus;

pub const EVENT_PRODUCT_STATUS_CHANGED: &str = "product.status_changed";

/// Body of a `menu-parsing` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseMenuMessage {
    /// Task id in its string form; workers reject values that are not UUIDs
    pub task_id: String,
    pub spreadsheet_id: String,
    pub restaurant_name: String,
}

impl ParseMenuMessage {
    pub fn new(
        task_id: Uuid,
        spreadsheet_id: impl Into<String>,
        restaurant_name: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            restaurant_name: restaurant_name.into(),
        }
    }
}

/// Body of a `product-status` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductStatusEvent {
    pub event_type: String,
    pub product_id: String,
    pub old_status: ProductStatus,
    pub new_status: ProductStatus,
    #[serde(default)]
    pub reason: String,
    /// Publishers always set it; consumers fill in "now" when it is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: String,
}

impl ProductStatusEvent {
    /// Build a `product.status_changed` event stamped with the current time
    pub fn status_changed(
        product_id: impl Into<String>,
        old_status: ProductStatus,
        new_status: ProductStatus,
        reason: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: EVENT_PRODUCT_STATUS_CHANGED.to_string(),
            product_id: product_id.into(),
            old_status,
            new_status,
            reason: reason.into(),
            timestamp: Some(Utc::now()),
            user_id: user_id.into(),
        }
    }

    /// Timestamp of the event, or now if the publisher did not send one
    pub fn timestamp_or_now(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or_else(Utc::now)
    }
}

/// Immutable record of one processed status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductStatusAudit {
    pub id: Uuid,
    pub product_id: String,
    pub event_type: String,
    pub old_status: ProductStatus,
    pub new_status: ProductStatus,
    pub reason: String,
    pub user_id: String,
    /// When the event was published
    pub timestamp: DateTime<Utc>,
    /// When the store committed the record; `None` until written.
    /// History is ordered by this, not by `timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl ProductStatusAudit {
    pub fn from_event(event: &ProductStatusEvent) -> Self {
        Self {
            id: Uuid::now_v7(),
            product_id: event.product_id.clone(),
            event_type: event.event_type.clone(),
            old_status: event.old_status,
            new_status: event.new_status,
            reason: event.reason.clone(),
            user_id: event.user_id.clone(),
            timestamp: event.timestamp_or_now(),
            recorded_at: None,
        }
    }
}
