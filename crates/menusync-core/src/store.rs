//! Document store abstraction
//!
//! Services only talk to persistence through these traits. Reads and
//! single-document writes go through the repositories; multi-document writes
//! that must land together go through a [`StoreTransaction`].

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::events::ProductStatusAudit;
use crate::menu::{Menu, ProductStatus};
use crate::task::{ParsingTask, ParsingTaskStatus};

/// Default number of audit records returned by history queries
pub const DEFAULT_AUDIT_LIMIT: usize = 100;

/// Errors from store operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub fn task_not_found(id: Uuid) -> Self {
        StoreError::NotFound {
            entity: "parsing task",
            id: id.to_string(),
        }
    }

    pub fn menu_not_found(id: impl ToString) -> Self {
        StoreError::NotFound {
            entity: "menu",
            id: id.to_string(),
        }
    }

    pub fn product_not_found(product_id: &str) -> Self {
        StoreError::NotFound {
            entity: "product",
            id: product_id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Outcome of a product status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductStatusChange {
    /// Menu that owns the product
    pub menu_id: Uuid,
    /// Status before the update
    pub previous: ProductStatus,
    /// False when the product was already at the requested status
    pub changed: bool,
}

// ============================================
// Repositories
// ============================================

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Persist a new task
    async fn create(&self, task: &ParsingTask) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<ParsingTask, StoreError>;

    /// Move a task to a non-completed status.
    ///
    /// `error_message` is only written when it is non-empty. Passing
    /// [`ParsingTaskStatus::Completed`] is rejected with
    /// [`StoreError::InvalidState`]; use [`TaskRepository::update_with_menu_id`].
    async fn update_status(
        &self,
        id: Uuid,
        status: ParsingTaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Complete a task with the menu it produced
    async fn update_with_menu_id(&self, id: Uuid, menu_id: Uuid) -> Result<(), StoreError>;

    async fn increment_retry_count(&self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MenuRepository: Send + Sync {
    async fn create(&self, menu: &Menu) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Menu, StoreError>;

    /// All menus of a restaurant, newest first
    async fn get_by_restaurant_id(&self, restaurant_id: &str) -> Result<Vec<Menu>, StoreError>;

    /// The menu whose product list contains `product_id`
    async fn find_menu_by_product_id(&self, product_id: &str) -> Result<Menu, StoreError>;

    /// Set the status of the product with `product_id`.
    ///
    /// Fails with [`StoreError::NotFound`] when no menu holds the product.
    /// Setting the current status again succeeds with `changed == false`.
    async fn update_product_status_by_product_id(
        &self,
        product_id: &str,
        status: ProductStatus,
    ) -> Result<ProductStatusChange, StoreError>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn create(&self, audit: &ProductStatusAudit) -> Result<(), StoreError>;

    /// Audit history of a product in reverse commit order, at most `limit`
    /// records. The first record carries the product's live status.
    async fn get_by_product_id(
        &self,
        product_id: &str,
        limit: usize,
    ) -> Result<Vec<ProductStatusAudit>, StoreError>;
}

// ============================================
// Transactions
// ============================================

/// A unit of work whose writes become visible together on commit.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn create_menu(&mut self, menu: &Menu) -> Result<(), StoreError>;

    async fn update_task_with_menu_id(
        &mut self,
        task_id: Uuid,
        menu_id: Uuid,
    ) -> Result<(), StoreError>;

    async fn update_product_status_by_product_id(
        &mut self,
        product_id: &str,
        status: ProductStatus,
    ) -> Result<ProductStatusChange, StoreError>;

    async fn create_audit(&mut self, audit: &ProductStatusAudit) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn abort(self: Box<Self>) -> Result<(), StoreError>;
}

/// Entry point to all persistence
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    fn tasks(&self) -> &dyn TaskRepository;

    fn menus(&self) -> &dyn MenuRepository;

    fn audits(&self) -> &dyn AuditRepository;

    /// Start a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release connections; later calls fail with [`StoreError::Closed`]
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_messages() {
        let id = Uuid::now_v7();
        assert_eq!(
            StoreError::task_not_found(id).to_string(),
            format!("parsing task not found: {id}")
        );
        assert_eq!(
            StoreError::product_not_found("p1").to_string(),
            "product not found: p1"
        );
        assert!(StoreError::menu_not_found(id).is_not_found());
        assert!(!StoreError::Closed.is_not_found());
    }
}
