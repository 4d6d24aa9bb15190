//! Pool setup for the PostgreSQL backend.

use std::time::{Duration, Instant};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::schema::init_schema;
use crate::config::DatabaseConfig;

pub type DbPool = PgPool;

/// Open a pool sized by `config` and create the schema if it is missing.
pub async fn connect(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect_with(config.connect_options()?)
        .await?;

    tracing::info!(
        url = %config.redacted_url(),
        max_connections = config.max_connections,
        "Connected to PostgreSQL"
    );

    init_schema(&pool).await?;
    Ok(pool)
}

/// Round-trip time of a trivial query; `None` when the database cannot be
/// reached.
pub async fn ping(pool: &DbPool) -> Option<Duration> {
    let started = Instant::now();
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
        Ok(_) => Some(started.elapsed()),
        Err(e) => {
            tracing::warn!(error = %e, "Database ping failed");
            None
        }
    }
}
