use crate::directory::PgDirectory;
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Open the pool, apply pending migrations and hand back the directory
pub async fn connect_directory(database_url: &str) -> Result<PgDirectory> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    tracing::info!("Database connection pool initialized");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations completed");

    Ok(PgDirectory::new(pool))
}
