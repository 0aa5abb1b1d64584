// Storage layer for menusync
// Decision: PostgreSQL via sqlx for production, in-memory for tests

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryDocumentStore, InMemoryTransaction};
pub use postgres::{run_migrations, PostgresDocumentStore, PostgresTransaction, MIGRATOR};
