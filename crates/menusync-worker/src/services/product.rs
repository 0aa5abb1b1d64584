// Product status changes
//
// Requests are published as events; the product-status worker applies them.
// Applying an event always writes an audit record, even when the product is
// already at the requested status.

use std::sync::Arc;
use std::time::Duration;

use menusync_core::{
    DocumentStore, Menu, ProductStatus, ProductStatusAudit, ProductStatusEvent, StoreError,
    StoreTransaction,
};
use menusync_queue::{Broker, QUEUE_PRODUCT_STATUS};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{abort_quietly, with_timeout, DEFAULT_STORE_TIMEOUT};
use crate::error::ServiceError;

pub struct ProductService {
    store: Arc<dyn DocumentStore>,
    broker: Arc<dyn Broker>,
    store_timeout: Duration,
}

impl ProductService {
    pub fn new(store: Arc<dyn DocumentStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Publish a status change for a product. Nothing is written to the store.
    #[instrument(skip(self, reason, user_id))]
    pub async fn request_status_change(
        &self,
        product_id: &str,
        new_status: ProductStatus,
        reason: &str,
        user_id: &str,
    ) -> Result<ProductStatusEvent, ServiceError> {
        let menu = with_timeout(
            self.store_timeout,
            "find menu by product",
            self.store.menus().find_menu_by_product_id(product_id),
        )
        .await?;
        let old_status = menu
            .product(product_id)
            .map(|p| p.status)
            .ok_or_else(|| ServiceError::from(StoreError::product_not_found(product_id)))?;

        let event =
            ProductStatusEvent::status_changed(product_id, old_status, new_status, reason, user_id);
        let payload = serde_json::to_vec(&event)?;
        self.broker.publish(QUEUE_PRODUCT_STATUS, &payload).await?;

        info!(
            %product_id,
            menu_id = %menu.id,
            old_status = %old_status,
            new_status = %new_status,
            "product status change requested"
        );
        Ok(event)
    }

    /// Apply a status event: update the product and write its audit record
    /// in one transaction.
    #[instrument(skip(self, event), fields(product_id = %event.product_id, new_status = %event.new_status))]
    pub async fn process_event(
        &self,
        event: &ProductStatusEvent,
    ) -> Result<ProductStatusAudit, ServiceError> {
        let audit = ProductStatusAudit::from_event(event);

        let work = async {
            let mut tx = self.store.begin().await?;
            let staged = stage_event(tx.as_mut(), event, &audit).await;
            match staged {
                Ok(changed) => {
                    tx.commit().await?;
                    Ok::<_, StoreError>(changed)
                }
                Err(e) => {
                    abort_quietly(tx).await;
                    Err(e)
                }
            }
        };

        let changed = match with_timeout(self.store_timeout, "product status transaction", work).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(error = %e, "failed to apply product status event");
                return Err(e);
            }
        };

        if changed {
            info!(audit_id = %audit.id, "product status updated");
        } else {
            debug!(audit_id = %audit.id, "product already at status, audited anyway");
        }
        Ok(audit)
    }

    /// Audit history of a product, most recently committed first
    pub async fn get_product_audit(
        &self,
        product_id: &str,
        limit: usize,
    ) -> Result<Vec<ProductStatusAudit>, ServiceError> {
        with_timeout(
            self.store_timeout,
            "get product audit",
            self.store.audits().get_by_product_id(product_id, limit),
        )
        .await
    }

    pub async fn get_menu(&self, menu_id: Uuid) -> Result<Menu, ServiceError> {
        with_timeout(
            self.store_timeout,
            "get menu",
            self.store.menus().get_by_id(menu_id),
        )
        .await
    }
}

async fn stage_event(
    tx: &mut dyn StoreTransaction,
    event: &ProductStatusEvent,
    audit: &ProductStatusAudit,
) -> Result<bool, StoreError> {
    let change = tx
        .update_product_status_by_product_id(&event.product_id, event.new_status)
        .await?;
    tx.create_audit(audit).await?;
    Ok(change.changed)
}
