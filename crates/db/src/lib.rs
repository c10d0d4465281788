//! Job Store: authoritative, durable bookkeeping of generation jobs.
//!
//! [`JobStore`] is the narrow repository interface the rest of the
//! orchestrator talks to. Two implementations are provided:
//! [`PgJobStore`] over PostgreSQL and [`InMemoryJobStore`] for
//! single-process deployments without a database.

use sqlx::postgres::PgPoolOptions;

pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub use memory::InMemoryJobStore;
pub use repositories::PgJobStore;
pub use store::{JobStore, StoreError, TransitionFields};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await?;
    Ok(())
}

/// Apply the embedded migrations in `crates/db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
