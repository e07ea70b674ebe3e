//! Database layer
//!
//! libsql storage for targets, probe results and incidents, implementing the
//! repository traits the monitoring engine depends on.

pub mod migrations;
pub mod models;
pub mod repository;

pub use repository::DatabaseImpl;

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
