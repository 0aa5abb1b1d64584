//! PostgreSQL implementation of DocumentStore
//!
//! - Menus are rows with JSONB `products`, `attribute_groups` and `attributes`
//! - Product lookups use a GIN-indexed containment query on `products`
//! - Status updates lock the owning menu row (`FOR UPDATE`) inside a transaction

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use menusync_core::{
    Attribute, AttributeGroup, AuditRepository, DocumentStore, Menu, MenuRepository,
    ParsingTask, ParsingTaskStatus, Product, ProductStatus, ProductStatusAudit,
    ProductStatusChange, StoreError, StoreTransaction, TaskRepository,
};

/// Embedded schema migrations (documents and queue tables)
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await.map_err(|e| {
        error!("Failed to run migrations: {}", e);
        StoreError::Database(e.to_string())
    })?;
    info!("database migrations applied");
    Ok(())
}

pub(crate) fn db_error(context: &str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolClosed => StoreError::Closed,
        other => {
            error!("{}: {}", context, other);
            StoreError::Database(other.to_string())
        }
    }
}

/// PostgreSQL implementation of DocumentStore
///
/// # Example
///
/// ```ignore
/// use menusync_storage::PostgresDocumentStore;
///
/// let store = PostgresDocumentStore::from_url("postgres://localhost/menusync", 20).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store from a database URL
    pub async fn from_url(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect to database", e))?;
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        run_migrations(&self.pool).await
    }

    async fn connection(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, StoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| db_error("Failed to acquire connection", e))
    }
}

// ============================================
// Row mapping
// ============================================

fn task_from_row(row: &PgRow) -> Result<ParsingTask, StoreError> {
    let status: String = row.get("status");
    let status = ParsingTaskStatus::parse(&status)
        .ok_or_else(|| StoreError::Serialization(format!("unknown task status: {status}")))?;

    Ok(ParsingTask {
        id: row.get("id"),
        status,
        spreadsheet_id: row.get("spreadsheet_id"),
        restaurant_name: row.get("restaurant_name"),
        menu_id: row.get("menu_id"),
        error_message: row.get("error_message"),
        retry_count: row.get("retry_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn menu_from_row(row: &PgRow) -> Result<Menu, StoreError> {
    let products: Json<Vec<Product>> = row
        .try_get("products")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let attribute_groups: Json<Vec<AttributeGroup>> = row
        .try_get("attribute_groups")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let attributes: Json<Vec<Attribute>> = row
        .try_get("attributes")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Menu {
        id: row.get("id"),
        name: row.get("name"),
        restaurant_id: row.get("restaurant_id"),
        products: products.0,
        attribute_groups: attribute_groups.0,
        attributes: attributes.0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_product_status(value: &str) -> Result<ProductStatus, StoreError> {
    value.parse().map_err(StoreError::Serialization)
}

fn audit_from_row(row: &PgRow) -> Result<ProductStatusAudit, StoreError> {
    let old_status: String = row.get("old_status");
    let new_status: String = row.get("new_status");
    let timestamp: DateTime<Utc> = row.get("timestamp");
    let recorded_at: DateTime<Utc> = row.get("recorded_at");

    Ok(ProductStatusAudit {
        id: row.get("id"),
        product_id: row.get("product_id"),
        event_type: row.get("event_type"),
        old_status: parse_product_status(&old_status)?,
        new_status: parse_product_status(&new_status)?,
        reason: row.get("reason"),
        user_id: row.get("user_id"),
        timestamp,
        recorded_at: Some(recorded_at),
    })
}

const MENU_COLUMNS: &str =
    "id, name, restaurant_id, products, attribute_groups, attributes, created_at, updated_at";

// ============================================
// Statements shared by the repositories and transactions
// ============================================

async fn insert_menu(conn: &mut PgConnection, menu: &Menu) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO menus (id, name, restaurant_id, products, attribute_groups, attributes, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(menu.id)
    .bind(&menu.name)
    .bind(&menu.restaurant_id)
    .bind(Json(&menu.products))
    .bind(Json(&menu.attribute_groups))
    .bind(Json(&menu.attributes))
    .bind(menu.created_at)
    .bind(menu.updated_at)
    .execute(conn)
    .await
    .map_err(|e| db_error("Failed to create menu", e))?;

    debug!(menu_id = %menu.id, products = menu.products.len(), "created menu");
    Ok(())
}

async fn complete_task(
    conn: &mut PgConnection,
    task_id: Uuid,
    menu_id: Uuid,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE parsing_tasks
        SET status = 'completed', menu_id = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(menu_id)
    .execute(conn)
    .await
    .map_err(|e| db_error("Failed to complete task", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::task_not_found(task_id));
    }
    Ok(())
}

async fn set_product_status(
    conn: &mut PgConnection,
    product_id: &str,
    status: ProductStatus,
) -> Result<ProductStatusChange, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {MENU_COLUMNS}
        FROM menus
        WHERE products @> jsonb_build_array(jsonb_build_object('id', $1::text))
        ORDER BY created_at, id
        LIMIT 1
        FOR UPDATE
        "#
    ))
    .bind(product_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("Failed to lock menu", e))?
    .ok_or_else(|| StoreError::product_not_found(product_id))?;

    let mut menu = menu_from_row(&row)?;
    let previous = menu
        .product(product_id)
        .map(|p| p.status)
        .ok_or_else(|| StoreError::product_not_found(product_id))?;
    let changed = menu.set_product_status(product_id, status).unwrap_or(false);

    if changed {
        sqlx::query(
            r#"
            UPDATE menus SET products = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(menu.id)
        .bind(Json(&menu.products))
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to update product status", e))?;
    }

    debug!(%product_id, menu_id = %menu.id, %previous, new_status = %status, changed, "set product status");
    Ok(ProductStatusChange {
        menu_id: menu.id,
        previous,
        changed,
    })
}

async fn insert_audit(conn: &mut PgConnection, audit: &ProductStatusAudit) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO product_status_audits
            (id, product_id, event_type, old_status, new_status, reason, user_id, timestamp)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(audit.id)
    .bind(&audit.product_id)
    .bind(&audit.event_type)
    .bind(audit.old_status.as_str())
    .bind(audit.new_status.as_str())
    .bind(&audit.reason)
    .bind(&audit.user_id)
    .bind(audit.timestamp)
    .execute(conn)
    .await
    .map_err(|e| db_error("Failed to create audit record", e))?;
    Ok(())
}

// ============================================
// Repositories
// ============================================

#[async_trait]
impl TaskRepository for PostgresDocumentStore {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn create(&self, task: &ParsingTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO parsing_tasks
                (id, status, spreadsheet_id, restaurant_name, menu_id, error_message, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(task.id)
        .bind(task.status.as_str())
        .bind(&task.spreadsheet_id)
        .bind(&task.restaurant_name)
        .bind(task.menu_id)
        .bind(&task.error_message)
        .bind(task.retry_count)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create task", e))?;

        debug!(task_id = %task.id, "created parsing task");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: Uuid) -> Result<ParsingTask, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, status, spreadsheet_id, restaurant_name, menu_id, error_message,
                   retry_count, created_at, updated_at
            FROM parsing_tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get task", e))?
        .ok_or_else(|| StoreError::task_not_found(id))?;

        task_from_row(&row)
    }

    #[instrument(skip(self, error_message))]
    async fn update_status(
        &self,
        id: Uuid,
        status: ParsingTaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        if status == ParsingTaskStatus::Completed {
            return Err(StoreError::InvalidState(
                "a task can only be completed together with its menu id".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE parsing_tasks
            SET status = $2,
                menu_id = NULL,
                error_message = COALESCE(NULLIF($3, ''), error_message),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update task status", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::task_not_found(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_with_menu_id(&self, id: Uuid, menu_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        complete_task(&mut conn, id, menu_id).await
    }

    #[instrument(skip(self))]
    async fn increment_retry_count(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE parsing_tasks
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to increment retry count", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::task_not_found(id));
        }
        Ok(())
    }
}

#[async_trait]
impl MenuRepository for PostgresDocumentStore {
    #[instrument(skip(self, menu), fields(menu_id = %menu.id))]
    async fn create(&self, menu: &Menu) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        insert_menu(&mut conn, menu).await
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: Uuid) -> Result<Menu, StoreError> {
        let row = sqlx::query(&format!("SELECT {MENU_COLUMNS} FROM menus WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get menu", e))?
            .ok_or_else(|| StoreError::menu_not_found(id))?;

        menu_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_by_restaurant_id(&self, restaurant_id: &str) -> Result<Vec<Menu>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MENU_COLUMNS} FROM menus WHERE restaurant_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(restaurant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list menus", e))?;

        rows.iter().map(menu_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn find_menu_by_product_id(&self, product_id: &str) -> Result<Menu, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {MENU_COLUMNS}
            FROM menus
            WHERE products @> jsonb_build_array(jsonb_build_object('id', $1::text))
            ORDER BY created_at, id
            LIMIT 1
            "#
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find menu by product", e))?
        .ok_or_else(|| StoreError::product_not_found(product_id))?;

        menu_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn update_product_status_by_product_id(
        &self,
        product_id: &str,
        status: ProductStatus,
    ) -> Result<ProductStatusChange, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        let change = set_product_status(&mut tx, product_id, status).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;
        Ok(change)
    }
}

#[async_trait]
impl AuditRepository for PostgresDocumentStore {
    #[instrument(skip(self, audit), fields(product_id = %audit.product_id))]
    async fn create(&self, audit: &ProductStatusAudit) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        insert_audit(&mut conn, audit).await
    }

    #[instrument(skip(self))]
    async fn get_by_product_id(
        &self,
        product_id: &str,
        limit: usize,
    ) -> Result<Vec<ProductStatusAudit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, event_type, old_status, new_status, reason, user_id,
                   timestamp, recorded_at
            FROM product_status_audits
            WHERE product_id = $1
            ORDER BY recorded_at DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(product_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list audit records", e))?;

        rows.iter().map(audit_from_row).collect()
    }
}

// ============================================
// Transactions
// ============================================

/// A PostgreSQL transaction; rolled back on drop unless committed
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn create_menu(&mut self, menu: &Menu) -> Result<(), StoreError> {
        insert_menu(&mut self.tx, menu).await
    }

    async fn update_task_with_menu_id(
        &mut self,
        task_id: Uuid,
        menu_id: Uuid,
    ) -> Result<(), StoreError> {
        complete_task(&mut self.tx, task_id, menu_id).await
    }

    async fn update_product_status_by_product_id(
        &mut self,
        product_id: &str,
        status: ProductStatus,
    ) -> Result<ProductStatusChange, StoreError> {
        set_product_status(&mut self.tx, product_id, status).await
    }

    async fn create_audit(&mut self, audit: &ProductStatusAudit) -> Result<(), StoreError> {
        insert_audit(&mut self.tx, audit).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            StoreError::Transaction(e.to_string())
        })
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(|e| {
            error!("Failed to roll back transaction: {}", e);
            StoreError::Transaction(e.to_string())
        })
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    fn tasks(&self) -> &dyn TaskRepository {
        self
    }

    fn menus(&self) -> &dyn MenuRepository {
        self
    }

    fn audits(&self) -> &dyn AuditRepository {
        self
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Database ping failed", e))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("document store closed");
    }
}
