// Menusync worker library
//
// Services implement the parsing task state machine and the product status
// event processor; workers bind them to the broker's queues.

pub mod app;
pub mod config;
pub mod error;
pub mod services;
pub mod sheets;
pub mod telemetry;
pub mod worker;

pub use app::{Application, HealthReport};
pub use config::{AppConfig, ConfigError};
pub use error::ServiceError;
pub use services::{ParsingService, ProductService, DEFAULT_STORE_TIMEOUT};
pub use sheets::GoogleSheetsMenuSource;
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use worker::{Dispatch, MenuParsingDispatch, ProductStatusDispatch, Worker, WorkerError};
