//! End-to-end pipeline scenarios on the in-memory broker and store
//!
//! Run with: cargo test -p menusync-worker --test pipeline_test

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use menusync_core::{
    DocumentStore, Menu, MenuSource, ParseMenuMessage, ParsingTaskStatus, Product,
    ProductStatus, TransformError, DEFAULT_AUDIT_LIMIT,
};
use menusync_queue::{
    Broker, BrokerError, ConsumerConfig, InMemoryBroker, RecordingClock, ERROR_HEADER,
    ORIGINAL_QUEUE_HEADER, QUEUE_MENU_PARSING, QUEUE_MENU_PARSING_DLQ, QUEUE_PRODUCT_STATUS,
    QUEUE_PRODUCT_STATUS_DLQ, RETRY_COUNT_HEADER,
};
use menusync_storage::InMemoryDocumentStore;
use menusync_worker::{Application, ServiceError};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

/// Menu source returning a fixed menu, or failing with a fixed reason
#[derive(Default)]
struct StubSource {
    failure: Mutex<Option<String>>,
}

#[async_trait]
impl MenuSource for StubSource {
    async fn parse_menu(
        &self,
        _spreadsheet_id: &str,
        restaurant_name: &str,
    ) -> Result<Menu, TransformError> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(TransformError::Fetch(reason));
        }
        let mut menu = Menu::new(restaurant_name);
        for (id, name) in [("p1", "Classic"), ("p2", "Double")] {
            menu.products.push(Product {
                id: id.to_string(),
                name: name.to_string(),
                is_combo: false,
                price: 10.0,
                category: "Burgers".to_string(),
                description: String::new(),
                status: ProductStatus::Available,
                attributes: vec![],
            });
        }
        Ok(menu)
    }
}

struct Harness {
    app: Application,
    store: InMemoryDocumentStore,
    broker: Arc<InMemoryBroker>,
    clock: RecordingClock,
    source: Arc<StubSource>,
}

async fn harness() -> Harness {
    let clock = RecordingClock::new();
    let config = ConsumerConfig::default().with_poll_interval(Duration::from_millis(5));
    let broker = Arc::new(InMemoryBroker::with_config(config, Arc::new(clock.clone())));
    let store = InMemoryDocumentStore::new();
    let source = Arc::new(StubSource::default());

    let app = Application::from_parts(
        Arc::new(store.clone()),
        broker.clone(),
        source.clone(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    Harness {
        app,
        store,
        broker,
        clock,
        source,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Run a parsing task to completion and return the menu id
async fn parsed_menu(h: &Harness) -> Uuid {
    let task_id = h.app.parsing().create_task("sheet-1", "Casa Pepe").await.unwrap();
    wait_until(|| h.store.tasks_with_status(ParsingTaskStatus::Completed).len() == 1).await;
    h.app.parsing().get_task(task_id).await.unwrap().menu_id.unwrap()
}

#[tokio::test]
async fn test_task_is_parsed_into_menu() {
    let h = harness().await;

    let task_id = h.app.parsing().create_task("sheet-1", "Casa Pepe").await.unwrap();
    let task = h.app.parsing().get_task(task_id).await.unwrap();
    assert_eq!(task.status, ParsingTaskStatus::Queued);

    h.app.start().await.unwrap();
    wait_until(|| h.store.tasks_with_status(ParsingTaskStatus::Completed).len() == 1).await;

    let task = h.app.parsing().get_task(task_id).await.unwrap();
    assert!(task.is_consistent());
    let menu = h.app.products().get_menu(task.menu_id.unwrap()).await.unwrap();
    assert_eq!(menu.restaurant_id, "casa-pepe");
    assert_eq!(menu.products.len(), 2);

    wait_until(|| h.broker.depth(QUEUE_MENU_PARSING) == 0).await;
    assert_eq!(h.broker.depth(QUEUE_MENU_PARSING_DLQ), 0);
    assert!(h.clock.sleeps().is_empty());

    h.app.shutdown().await;
}

#[tokio::test]
async fn test_publish_failure_fails_task() {
    let h = harness().await;
    h.broker.fail_publishes("broker unavailable");

    let err = h
        .app
        .parsing()
        .create_task("sheet-1", "Casa Pepe")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Broker(BrokerError::Transport(_))));

    let failed = h.store.tasks_with_status(ParsingTaskStatus::Failed);
    assert_eq!(failed.len(), 1);
    assert!(!failed[0].error_message.clone().unwrap_or_default().is_empty());
    assert_eq!(h.broker.depth(QUEUE_MENU_PARSING), 0);
}

#[test_log::test(tokio::test)]
async fn test_failing_source_retries_then_dead_letters() {
    let h = harness().await;
    *h.source.failure.lock() = Some("sheet is private".to_string());
    h.app.start().await.unwrap();

    let task_id = h.app.parsing().create_task("sheet-1", "Casa Pepe").await.unwrap();
    wait_until(|| h.broker.depth(QUEUE_MENU_PARSING_DLQ) == 1).await;

    assert_eq!(
        h.clock.sleeps(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );

    let task = h.app.parsing().get_task(task_id).await.unwrap();
    assert_eq!(task.status, ParsingTaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert!(task.menu_id.is_none());
    assert!(task.error_message.unwrap().contains("sheet is private"));

    let dead = &h.broker.messages(QUEUE_MENU_PARSING_DLQ)[0];
    let body: ParseMenuMessage = serde_json::from_slice(&dead.payload).unwrap();
    assert_eq!(body, ParseMenuMessage::new(task_id, "sheet-1", "Casa Pepe"));
    assert_eq!(dead.header_str(ORIGINAL_QUEUE_HEADER), Some(QUEUE_MENU_PARSING));
    assert_eq!(dead.header_u32(RETRY_COUNT_HEADER), Some(3));
    assert!(dead.header_str(ERROR_HEADER).unwrap().contains("sheet is private"));
    assert_eq!(h.store.menu_count(), 0);

    h.app.shutdown().await;
}

#[tokio::test]
async fn test_invalid_task_id_is_dead_lettered_byte_for_byte() {
    let h = harness().await;
    h.app.start().await.unwrap();

    let payload = br#"{"task_id":"not-a-uuid","spreadsheet_id":"s","restaurant_name":"r"}"#;
    h.broker.publish(QUEUE_MENU_PARSING, payload).await.unwrap();
    h.broker.publish(QUEUE_MENU_PARSING, b"not json").await.unwrap();

    wait_until(|| h.broker.depth(QUEUE_MENU_PARSING_DLQ) == 2).await;

    let dead = h.broker.messages(QUEUE_MENU_PARSING_DLQ);
    let bodies: Vec<&[u8]> = dead.iter().map(|d| d.payload.as_slice()).collect();
    assert!(bodies.contains(&payload.as_slice()));
    assert!(bodies.contains(&b"not json".as_slice()));
    assert_eq!(h.store.task_count(), 0);

    h.app.shutdown().await;
}

#[tokio::test]
async fn test_status_change_is_applied_and_audited() {
    let h = harness().await;
    h.app.start().await.unwrap();
    let menu_id = parsed_menu(&h).await;

    let event = h
        .app
        .products()
        .request_status_change("p1", ProductStatus::NotAvailable, "86'd", "u1")
        .await
        .unwrap();
    assert_eq!(event.old_status, ProductStatus::Available);

    wait_until(|| h.store.audit_count() == 1).await;

    let menu = h.app.products().get_menu(menu_id).await.unwrap();
    assert_eq!(menu.product("p1").unwrap().status, ProductStatus::NotAvailable);
    assert_eq!(menu.product("p2").unwrap().status, ProductStatus::Available);

    let history = h
        .app
        .products()
        .get_product_audit("p1", DEFAULT_AUDIT_LIMIT)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].old_status, ProductStatus::Available);
    assert_eq!(history[0].new_status, ProductStatus::NotAvailable);
    assert_eq!(history[0].reason, "86'd");
    assert_eq!(history[0].user_id, "u1");

    h.app.shutdown().await;
}

#[tokio::test]
async fn test_repeated_event_is_audited_twice() {
    let h = harness().await;
    h.app.start().await.unwrap();
    let menu_id = parsed_menu(&h).await;

    let body = json!({
        "event_type": "product.status_changed",
        "product_id": "p2",
        "old_status": "available",
        "new_status": "deleted",
        "reason": "discontinued",
        "user_id": "u2"
    });
    let payload = serde_json::to_vec(&body).unwrap();
    h.broker.publish(QUEUE_PRODUCT_STATUS, &payload).await.unwrap();
    h.broker.publish(QUEUE_PRODUCT_STATUS, &payload).await.unwrap();

    wait_until(|| h.store.audit_count() == 2).await;

    let menu = h.app.products().get_menu(menu_id).await.unwrap();
    assert_eq!(menu.product("p2").unwrap().status, ProductStatus::Deleted);

    // events published without a timestamp are stamped on consumption
    let history = h.app.products().get_product_audit("p2", 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|a| a.new_status == ProductStatus::Deleted));
    assert!(history[0].recorded_at >= history[1].recorded_at);

    h.app.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_event_for_unknown_product_is_dead_lettered() {
    let h = harness().await;
    h.app.start().await.unwrap();

    let body = json!({
        "event_type": "product.status_changed",
        "product_id": "ghost",
        "old_status": "available",
        "new_status": "not_available",
        "reason": "",
        "timestamp": "2026-03-01T12:00:00Z",
        "user_id": ""
    });
    let payload = serde_json::to_vec(&body).unwrap();
    h.broker.publish(QUEUE_PRODUCT_STATUS, &payload).await.unwrap();

    wait_until(|| h.broker.depth(QUEUE_PRODUCT_STATUS_DLQ) == 1).await;

    let dead = &h.broker.messages(QUEUE_PRODUCT_STATUS_DLQ)[0];
    assert_eq!(dead.payload, payload);
    assert!(dead.header_str(ERROR_HEADER).unwrap().contains("ghost"));
    assert_eq!(h.store.audit_count(), 0);
    assert_eq!(h.clock.sleeps().len(), 3);

    h.app.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_broker_then_store() {
    let h = harness().await;
    h.app.start().await.unwrap();

    let health = h.app.health().await;
    assert!(health.is_healthy());

    h.store.set_unreachable(true);
    let health = h.app.health().await;
    assert!(health.broker_reachable);
    assert!(!health.store_reachable);
    h.store.clear_faults();

    h.app.shutdown().await;
    for worker in h.app.workers() {
        assert!(!worker.is_running().await);
    }

    let health = h.app.health().await;
    assert!(!health.broker_reachable);
    assert!(!health.store_reachable);

    let err = h.broker.publish(QUEUE_MENU_PARSING, b"{}").await.unwrap_err();
    assert!(matches!(err, BrokerError::Closed));
    assert!(h.store.ping().await.is_err());
}
