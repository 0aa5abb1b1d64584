//! In-memory implementation of DocumentStore for testing
//!
//! Transactions stage their writes and apply them under a single write lock
//! on commit, so readers never observe half of a transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use menusync_core::{
    AuditRepository, DocumentStore, Menu, MenuRepository, ParsingTask, ParsingTaskStatus,
    ProductStatus, ProductStatusAudit, ProductStatusChange, StoreError, StoreTransaction,
    TaskRepository,
};

#[derive(Default, Clone)]
struct State {
    tasks: HashMap<Uuid, ParsingTask>,
    menus: HashMap<Uuid, Menu>,
    audits: Vec<ProductStatusAudit>,
}

impl State {
    /// Oldest menu containing the product
    fn menu_with_product(&self, product_id: &str) -> Option<&Menu> {
        self.menus
            .values()
            .filter(|m| m.product(product_id).is_some())
            .min_by_key(|m| (m.created_at, m.id))
    }

    fn menu_with_product_mut(&mut self, product_id: &str) -> Option<&mut Menu> {
        let id = self.menu_with_product(product_id)?.id;
        self.menus.get_mut(&id)
    }

    /// Append an audit; `audits` stays in commit order
    fn record_audit(&mut self, mut audit: ProductStatusAudit) {
        audit.recorded_at = Some(Utc::now());
        self.audits.push(audit);
    }
}

/// Failures to inject into the next operations
#[derive(Default)]
struct Faults {
    create_menu: Option<String>,
    commit: Option<String>,
    stall_commits: bool,
    stall_retry_counts: bool,
    unreachable: bool,
}

struct Shared {
    state: RwLock<State>,
    faults: Mutex<Faults>,
    closed: AtomicBool,
    commits: AtomicUsize,
    aborts: AtomicUsize,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

/// In-memory implementation of DocumentStore
///
/// Provides the same semantics as the PostgreSQL implementation, plus fault
/// injection and counters for tests.
///
/// # Example
///
/// ```
/// use menusync_storage::InMemoryDocumentStore;
///
/// let store = InMemoryDocumentStore::new();
/// assert_eq!(store.menu_count(), 0);
/// ```
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    shared: Arc<Shared>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
                faults: Mutex::new(Faults::default()),
                closed: AtomicBool::new(false),
                commits: AtomicUsize::new(0),
                aborts: AtomicUsize::new(0),
            }),
        }
    }

    pub fn task_count(&self) -> usize {
        self.shared.state.read().tasks.len()
    }

    /// Tasks currently in `status`, oldest first
    pub fn tasks_with_status(&self, status: ParsingTaskStatus) -> Vec<ParsingTask> {
        let mut tasks: Vec<_> = self
            .shared
            .state
            .read()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        tasks
    }

    pub fn menu_count(&self) -> usize {
        self.shared.state.read().menus.len()
    }

    pub fn audit_count(&self) -> usize {
        self.shared.state.read().audits.len()
    }

    /// Number of committed transactions
    pub fn commit_count(&self) -> usize {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Number of explicitly aborted transactions
    pub fn abort_count(&self) -> usize {
        self.shared.aborts.load(Ordering::SeqCst)
    }

    /// Make menu inserts fail until cleared
    pub fn fail_menu_inserts(&self, reason: impl Into<String>) {
        self.shared.faults.lock().create_menu = Some(reason.into());
    }

    /// Make transaction commits fail until cleared
    pub fn fail_commits(&self, reason: impl Into<String>) {
        self.shared.faults.lock().commit = Some(reason.into());
    }

    /// Make transaction commits hang until cleared
    pub fn stall_commits(&self) {
        self.shared.faults.lock().stall_commits = true;
    }

    /// Make `increment_retry_count` hang until cleared
    pub fn stall_retry_counts(&self) {
        self.shared.faults.lock().stall_retry_counts = true;
    }

    /// Make `ping` fail until cleared
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.faults.lock().unreachable = unreachable;
    }

    pub fn clear_faults(&self) {
        *self.shared.faults.lock() = Faults::default();
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.shared.state.write();
        state.tasks.clear();
        state.menus.clear();
        state.audits.clear();
    }

    fn injected_menu_failure(&self) -> Option<String> {
        self.shared.faults.lock().create_menu.clone()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for InMemoryDocumentStore {
    async fn create(&self, task: &ParsingTask) -> Result<(), StoreError> {
        self.shared.ensure_open()?;
        let mut state = self.shared.state.write();
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::Database(format!(
                "duplicate parsing task id: {}",
                task.id
            )));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<ParsingTask, StoreError> {
        self.shared.ensure_open()?;
        self.shared
            .state
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::task_not_found(id))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ParsingTaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.shared.ensure_open()?;
        let mut state = self.shared.state.write();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::task_not_found(id))?;

        if !task.transition(status, error_message) {
            return Err(StoreError::InvalidState(
                "a task can only be completed together with its menu id".to_string(),
            ));
        }
        Ok(())
    }

    async fn update_with_menu_id(&self, id: Uuid, menu_id: Uuid) -> Result<(), StoreError> {
        self.shared.ensure_open()?;
        let mut state = self.shared.state.write();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::task_not_found(id))?;
        task.complete(menu_id);
        Ok(())
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<(), StoreError> {
        self.shared.ensure_open()?;
        let stalled = self.shared.faults.lock().stall_retry_counts;
        if stalled {
            std::future::pending::<()>().await;
        }
        let mut state = self.shared.state.write();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::task_not_found(id))?;
        task.retry_count += 1;
        task.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl MenuRepository for InMemoryDocumentStore {
    async fn create(&self, menu: &Menu) -> Result<(), StoreError> {
        self.shared.ensure_open()?;
        if let Some(reason) = self.injected_menu_failure() {
            return Err(StoreError::Database(reason));
        }
        let mut state = self.shared.state.write();
        if state.menus.contains_key(&menu.id) {
            return Err(StoreError::Database(format!("duplicate menu id: {}", menu.id)));
        }
        state.menus.insert(menu.id, menu.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Menu, StoreError> {
        self.shared.ensure_open()?;
        self.shared
            .state
            .read()
            .menus
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::menu_not_found(id))
    }

    async fn get_by_restaurant_id(&self, restaurant_id: &str) -> Result<Vec<Menu>, StoreError> {
        self.shared.ensure_open()?;
        let state = self.shared.state.read();
        let mut menus: Vec<Menu> = state
            .menus
            .values()
            .filter(|m| m.restaurant_id == restaurant_id)
            .cloned()
            .collect();
        menus.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(menus)
    }

    async fn find_menu_by_product_id(&self, product_id: &str) -> Result<Menu, StoreError> {
        self.shared.ensure_open()?;
        self.shared
            .state
            .read()
            .menu_with_product(product_id)
            .cloned()
            .ok_or_else(|| StoreError::product_not_found(product_id))
    }

    async fn update_product_status_by_product_id(
        &self,
        product_id: &str,
        status: ProductStatus,
    ) -> Result<ProductStatusChange, StoreError> {
        self.shared.ensure_open()?;
        let mut state = self.shared.state.write();
        apply_product_status(&mut state, product_id, status)
    }
}

#[async_trait]
impl AuditRepository for InMemoryDocumentStore {
    async fn create(&self, audit: &ProductStatusAudit) -> Result<(), StoreError> {
        self.shared.ensure_open()?;
        self.shared.state.write().record_audit(audit.clone());
        Ok(())
    }

    async fn get_by_product_id(
        &self,
        product_id: &str,
        limit: usize,
    ) -> Result<Vec<ProductStatusAudit>, StoreError> {
        self.shared.ensure_open()?;
        let state = self.shared.state.read();
        let audits = state
            .audits
            .iter()
            .rev()
            .filter(|a| a.product_id == product_id)
            .take(limit)
            .cloned()
            .collect();
        Ok(audits)
    }
}

fn apply_product_status(
    state: &mut State,
    product_id: &str,
    status: ProductStatus,
) -> Result<ProductStatusChange, StoreError> {
    let menu = state
        .menu_with_product_mut(product_id)
        .ok_or_else(|| StoreError::product_not_found(product_id))?;
    let previous = menu
        .product(product_id)
        .map(|p| p.status)
        .ok_or_else(|| StoreError::product_not_found(product_id))?;
    let changed = menu.set_product_status(product_id, status).unwrap_or(false);

    Ok(ProductStatusChange {
        menu_id: menu.id,
        previous,
        changed,
    })
}

// ============================================
// Transactions
// ============================================

enum StagedWrite {
    CreateMenu(Menu),
    CompleteTask { task_id: Uuid, menu_id: Uuid },
    SetProductStatus { product_id: String, status: ProductStatus },
    CreateAudit(ProductStatusAudit),
}

/// Transaction over [`InMemoryDocumentStore`]
///
/// Operations validate against a private copy of the state that already
/// contains the staged writes; commit replays them onto the shared state.
pub struct InMemoryTransaction {
    store: InMemoryDocumentStore,
    view: State,
    staged: Vec<StagedWrite>,
}

impl InMemoryTransaction {
    fn new(store: InMemoryDocumentStore) -> Self {
        let view = store.shared.state.read().clone();
        Self {
            store,
            view,
            staged: Vec::new(),
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn create_menu(&mut self, menu: &Menu) -> Result<(), StoreError> {
        self.store.shared.ensure_open()?;
        if let Some(reason) = self.store.injected_menu_failure() {
            return Err(StoreError::Database(reason));
        }
        if self.view.menus.contains_key(&menu.id) {
            return Err(StoreError::Database(format!("duplicate menu id: {}", menu.id)));
        }
        self.view.menus.insert(menu.id, menu.clone());
        self.staged.push(StagedWrite::CreateMenu(menu.clone()));
        Ok(())
    }

    async fn update_task_with_menu_id(
        &mut self,
        task_id: Uuid,
        menu_id: Uuid,
    ) -> Result<(), StoreError> {
        self.store.shared.ensure_open()?;
        let task = self
            .view
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::task_not_found(task_id))?;
        task.complete(menu_id);
        self.staged
            .push(StagedWrite::CompleteTask { task_id, menu_id });
        Ok(())
    }

    async fn update_product_status_by_product_id(
        &mut self,
        product_id: &str,
        status: ProductStatus,
    ) -> Result<ProductStatusChange, StoreError> {
        self.store.shared.ensure_open()?;
        let change = apply_product_status(&mut self.view, product_id, status)?;
        self.staged.push(StagedWrite::SetProductStatus {
            product_id: product_id.to_string(),
            status,
        });
        Ok(change)
    }

    async fn create_audit(&mut self, audit: &ProductStatusAudit) -> Result<(), StoreError> {
        self.store.shared.ensure_open()?;
        self.view.audits.push(audit.clone());
        self.staged.push(StagedWrite::CreateAudit(audit.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let shared = &this.store.shared;
        shared.ensure_open()?;
        let stalled = shared.faults.lock().stall_commits;
        if stalled {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = shared.faults.lock().commit.clone() {
            return Err(StoreError::Transaction(reason));
        }

        let mut state = shared.state.write();
        // Replay onto a copy so a failing write leaves the shared state untouched
        let mut next = state.clone();
        for write in this.staged {
            match write {
                StagedWrite::CreateMenu(menu) => {
                    if next.menus.contains_key(&menu.id) {
                        return Err(StoreError::Transaction(format!(
                            "duplicate menu id: {}",
                            menu.id
                        )));
                    }
                    next.menus.insert(menu.id, menu);
                }
                StagedWrite::CompleteTask { task_id, menu_id } => {
                    let task = next.tasks.get_mut(&task_id).ok_or_else(|| {
                        StoreError::Transaction(format!("parsing task {task_id} disappeared"))
                    })?;
                    task.complete(menu_id);
                }
                StagedWrite::SetProductStatus { product_id, status } => {
                    apply_product_status(&mut next, &product_id, status).map_err(|_| {
                        StoreError::Transaction(format!("product {product_id} disappeared"))
                    })?;
                }
                StagedWrite::CreateAudit(audit) => next.record_audit(audit),
            }
        }
        *state = next;
        shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        self.store.shared.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
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
        self.shared.ensure_open()?;
        Ok(Box::new(InMemoryTransaction::new(self.clone())))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.shared.ensure_open()?;
        if self.shared.faults.lock().unreachable {
            return Err(StoreError::Database("store unreachable".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}
