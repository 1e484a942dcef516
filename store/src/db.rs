//! Pool construction and schema migration.

use chantier_core::error::{EngineError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Embedded schema migrator.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Connect to a database URL and run migrations.
///
/// Foreign keys are enabled on every connection; the cascade semantics of
/// the schema depend on them.
///
/// # Errors
///
/// Returns [`EngineError::Database`] if the connection or a migration
/// fails.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests and examples.
///
/// A single pooled connection with no idle timeout: SQLite in-memory
/// databases live and die with their connection, so the pool must never
/// recycle it.
///
/// # Errors
///
/// Returns [`EngineError::Database`] if the connection or a migration
/// fails.
pub async fn in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run pending migrations on an existing pool.
///
/// # Errors
///
/// Returns [`EngineError::Database`] if a migration fails.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| EngineError::Database(format!("migration failed: {e}")))
}
