//! Business services driven by the HTTP layer and the queue workers

mod parsing;
mod product;

pub use parsing::ParsingService;
pub use product::ProductService;

use std::future::Future;
use std::time::Duration;

use menusync_core::{StoreError, StoreTransaction};
use tracing::warn;

use crate::error::ServiceError;

/// Default time budget for a store operation or transaction
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a store operation with a deadline
pub(crate) async fn with_timeout<T, F>(
    limit: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(_) => {
            warn!(operation, timeout_ms = limit.as_millis() as u64, "store operation timed out");
            Err(ServiceError::Timeout(operation))
        }
    }
}

/// Roll back a transaction, logging instead of failing
pub(crate) async fn abort_quietly(tx: Box<dyn StoreTransaction>) {
    if let Err(e) = tx.abort().await {
        warn!(error = %e, "failed to abort transaction");
    }
}
