//! # menusync core
//!
//! Domain model shared by the queue consumers and the stores:
//!
//! - [`ParsingTask`]: lifecycle of a "parse this spreadsheet" request
//! - [`Menu`] and its embedded [`Product`]s
//! - Queue envelopes ([`ParseMenuMessage`], [`ProductStatusEvent`]) and
//!   [`ProductStatusAudit`] records
//! - Persistence traits ([`DocumentStore`], [`StoreTransaction`] and the
//!   repositories) implemented by `menusync-storage`
//! - [`MenuSource`], the spreadsheet transform seam

pub mod events;
pub mod menu;
pub mod sheet;
pub mod source;
pub mod store;
pub mod task;

pub use events::{
    ParseMenuMessage, ProductStatusAudit, ProductStatusEvent, EVENT_PRODUCT_STATUS_CHANGED,
};
pub use menu::{restaurant_id_from_name, Attribute, AttributeGroup, Menu, Product, ProductStatus};
pub use sheet::{menu_from_rows, SHEET_RANGE};
pub use source::{MenuSource, TransformError};
pub use store::{
    AuditRepository, DocumentStore, MenuRepository, ProductStatusChange, StoreError,
    StoreTransaction, TaskRepository, DEFAULT_AUDIT_LIMIT,
};
pub use task::{ParsingTask, ParsingTaskStatus};
