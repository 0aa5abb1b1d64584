// Error types for the services and workers

use menusync_core::{StoreError, TransformError};
use menusync_queue::BrokerError;
use thiserror::Error;

/// Errors returned by the parsing and product services
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Publishing or consuming failed
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Store failure other than a missing document
    #[error("store error: {0}")]
    Store(StoreError),

    /// Task, menu or product does not exist
    #[error("{0}")]
    NotFound(String),

    /// Message body is not a valid envelope
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid id: {0:?}")]
    InvalidId(String),

    #[error("menu transform failed: {0}")]
    Transform(#[from] TransformError),

    /// A store operation exceeded its time budget
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => ServiceError::NotFound(e.to_string()),
            other => ServiceError::Store(other),
        }
    }
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }
}
