/// Persistence layer
///
/// The polling engine only talks to the [`Store`] and [`NodeDirectory`]
/// traits. Two implementations ship: a LibSQL database and an in-memory
/// store for tests and ephemeral runs.
pub mod memory;
pub mod migrations;
pub mod repository;

pub use memory::MemoryStore;
pub use repository::{DatabaseImpl, NodeDirectory, Store, StoreError};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
