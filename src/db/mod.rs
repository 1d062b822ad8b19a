use crate::error::AppError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

const IN_MEMORY_URL: &str = "sqlite::memory:";

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Session cache that lives as long as the pool; one pinned connection keeps it alive.
pub async fn initialize_in_memory_pool() -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::from_str(IN_MEMORY_URL)?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(connect_options)
        .await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool(session_db: Option<&Path>) -> Result<SqlitePool, AppError> {
    match session_db {
        Some(path) => initialize_pool_from_path(path).await,
        None => initialize_in_memory_pool().await,
    }
}
