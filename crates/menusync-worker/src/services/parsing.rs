// Parsing task state machine
//
// queued -> processing -> completed (menu persisted, menu_id set)
//                     \-> failed    (error_message set)

use std::sync::Arc;
use std::time::Duration;

use menusync_core::{
    DocumentStore, Menu, MenuSource, ParseMenuMessage, ParsingTask, ParsingTaskStatus,
    StoreError, StoreTransaction,
};
use menusync_queue::{Broker, QUEUE_MENU_PARSING};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{abort_quietly, with_timeout, DEFAULT_STORE_TIMEOUT};
use crate::error::ServiceError;

/// Creates parsing tasks and turns delivered tasks into persisted menus
pub struct ParsingService {
    store: Arc<dyn DocumentStore>,
    broker: Arc<dyn Broker>,
    source: Arc<dyn MenuSource>,
    store_timeout: Duration,
}

impl ParsingService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        broker: Arc<dyn Broker>,
        source: Arc<dyn MenuSource>,
    ) -> Self {
        Self {
            store,
            broker,
            source,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Record a queued task and publish it to the parsing queue.
    ///
    /// When the publish fails the task is marked failed and the publish
    /// error is returned.
    #[instrument(skip(self))]
    pub async fn create_task(
        &self,
        spreadsheet_id: &str,
        restaurant_name: &str,
    ) -> Result<Uuid, ServiceError> {
        let task = ParsingTask::new(spreadsheet_id, restaurant_name);
        with_timeout(
            self.store_timeout,
            "create parsing task",
            self.store.tasks().create(&task),
        )
        .await?;

        let message = ParseMenuMessage::new(task.id, spreadsheet_id, restaurant_name);
        let payload = serde_json::to_vec(&message)?;

        if let Err(e) = self.broker.publish(QUEUE_MENU_PARSING, &payload).await {
            error!(task_id = %task.id, error = %e, "failed to publish parsing task");
            self.mark_failed(task.id, &format!("failed to publish task: {e}"))
                .await;
            return Err(e.into());
        }

        info!(task_id = %task.id, %spreadsheet_id, "parsing task queued");
        Ok(task.id)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<ParsingTask, ServiceError> {
        with_timeout(
            self.store_timeout,
            "get parsing task",
            self.store.tasks().get_by_id(task_id),
        )
        .await
    }

    /// Parse the task's spreadsheet and persist the menu.
    ///
    /// `retry_count` is the number of earlier deliveries of this task. Returns
    /// the id of the stored menu; on any failure the task ends up `failed`
    /// and the error is returned.
    #[instrument(skip(self))]
    pub async fn process_task(&self, task_id: Uuid, retry_count: u32) -> Result<Uuid, ServiceError> {
        let task = self.get_task(task_id).await?;

        if let (ParsingTaskStatus::Completed, Some(menu_id)) = (task.status, task.menu_id) {
            info!(%task_id, %menu_id, "task already completed, skipping");
            return Ok(menu_id);
        }

        if retry_count > 0 {
            let recorded = with_timeout(
                self.store_timeout,
                "record task retry",
                self.store.tasks().increment_retry_count(task_id),
            )
            .await;
            if let Err(e) = recorded {
                warn!(%task_id, error = %e, "failed to record retry");
            }
        }

        with_timeout(
            self.store_timeout,
            "mark task processing",
            self.store
                .tasks()
                .update_status(task_id, ParsingTaskStatus::Processing, None),
        )
        .await?;

        let menu = match self
            .source
            .parse_menu(&task.spreadsheet_id, &task.restaurant_name)
            .await
        {
            Ok(menu) => menu,
            Err(e) => {
                warn!(%task_id, error = %e, "failed to parse spreadsheet");
                self.mark_failed(task_id, &format!("failed to parse menu: {e}"))
                    .await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.save_menu(task_id, &menu).await {
            error!(%task_id, error = %e, "failed to save menu");
            self.mark_failed(task_id, &format!("failed to save menu: {e}"))
                .await;
            return Err(e);
        }

        info!(%task_id, menu_id = %menu.id, products = menu.products.len(), "menu parsed");
        Ok(menu.id)
    }

    /// Insert the menu and complete the task in one transaction
    async fn save_menu(&self, task_id: Uuid, menu: &Menu) -> Result<(), ServiceError> {
        let work = async {
            let mut tx = self.store.begin().await?;
            let staged = stage_menu(tx.as_mut(), task_id, menu).await;
            if let Err(e) = staged {
                abort_quietly(tx).await;
                return Err(e);
            }
            tx.commit().await
        };
        with_timeout(self.store_timeout, "menu transaction", work).await
    }

    async fn mark_failed(&self, task_id: Uuid, reason: &str) {
        let update = with_timeout(
            self.store_timeout,
            "mark task failed",
            self.store
                .tasks()
                .update_status(task_id, ParsingTaskStatus::Failed, Some(reason)),
        )
        .await;
        if let Err(e) = update {
            error!(%task_id, error = %e, "failed to mark task as failed");
        }
    }
}

async fn stage_menu(
    tx: &mut dyn StoreTransaction,
    task_id: Uuid,
    menu: &Menu,
) -> Result<(), StoreError> {
    tx.create_menu(menu).await?;
    tx.update_task_with_menu_id(task_id, menu.id).await
}
