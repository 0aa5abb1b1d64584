// Process wiring: store, broker, services and workers
// Decision: shutdown order is workers, then broker, then store, so no handler
// runs against a closed transport

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use menusync_core::{DocumentStore, MenuSource};
use menusync_queue::{declare_well_known_queues, Broker, PostgresBroker};
use menusync_storage::PostgresDocumentStore;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::services::{ParsingService, ProductService};
use crate::sheets::GoogleSheetsMenuSource;
use crate::worker::{Worker, WorkerError};

/// Reachability of the external dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub broker_reachable: bool,
    pub store_reachable: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.broker_reachable && self.store_reachable
    }
}

pub struct Application {
    store: Arc<dyn DocumentStore>,
    broker: Arc<dyn Broker>,
    parsing: Arc<ParsingService>,
    products: Arc<ProductService>,
    workers: Vec<Worker>,
    shutdown: CancellationToken,
}

impl Application {
    /// Connect to PostgreSQL, run migrations and declare the queues
    pub async fn bootstrap(config: &AppConfig) -> Result<Self> {
        let store = PostgresDocumentStore::from_url(
            &config.database_url,
            config.database_max_connections,
        )
        .await
        .context("Failed to connect to database")?;
        store.migrate().await.context("Failed to run migrations")?;
        info!("database migrations applied");

        let broker = PostgresBroker::new(store.pool().clone(), config.consumer_config())
            .with_visibility_timeout(config.visibility_timeout);
        info!(consumer_id = %broker.consumer_id(), "broker connected");

        let source = GoogleSheetsMenuSource::with_base_url(
            config.sheets_base_url.clone(),
            config.sheets_api_key.clone(),
        );
        if config.sheets_api_key.is_none() {
            warn!("GOOGLE_SHEETS_API_KEY not set, parsing tasks will fail");
        }

        Self::from_parts(
            Arc::new(store),
            Arc::new(broker),
            Arc::new(source),
            config.store_timeout,
        )
        .await
    }

    /// Assemble the application from already constructed dependencies.
    ///
    /// Declares the work and dead-letter queues; workers are created but not
    /// started.
    pub async fn from_parts(
        store: Arc<dyn DocumentStore>,
        broker: Arc<dyn Broker>,
        source: Arc<dyn MenuSource>,
        store_timeout: Duration,
    ) -> Result<Self> {
        declare_well_known_queues(broker.as_ref())
            .await
            .context("Failed to declare queues")?;

        let parsing = Arc::new(
            ParsingService::new(store.clone(), broker.clone(), source)
                .with_store_timeout(store_timeout),
        );
        let products = Arc::new(
            ProductService::new(store.clone(), broker.clone()).with_store_timeout(store_timeout),
        );

        let shutdown = CancellationToken::new();
        let workers = vec![
            Worker::menu_parsing(broker.clone(), parsing.clone()).with_shutdown(&shutdown),
            Worker::product_status(broker.clone(), products.clone()).with_shutdown(&shutdown),
        ];

        Ok(Self {
            store,
            broker,
            parsing,
            products,
            workers,
            shutdown,
        })
    }

    pub fn parsing(&self) -> &Arc<ParsingService> {
        &self.parsing
    }

    pub fn products(&self) -> &Arc<ProductService> {
        &self.products
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Start every worker
    pub async fn start(&self) -> Result<(), WorkerError> {
        for worker in &self.workers {
            worker.start().await?;
        }
        Ok(())
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            broker_reachable: self.broker.is_reachable().await,
            store_reachable: self.store.ping().await.is_ok(),
        }
    }

    /// Stop workers, then close the broker, then close the store
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.cancel();
        for worker in &self.workers {
            if let Err(e) = worker.stop().await {
                error!(worker = worker.name(), error = %e, "failed to stop worker");
            }
        }
        if let Err(e) = self.broker.close().await {
            error!(error = %e, "failed to close broker");
        }
        self.store.close().await;
        info!("shutdown complete");
    }
}
