pub mod identity;
pub mod points;
pub mod schema;
pub mod sessions;
pub mod summary;

#[cfg(test)]
mod tests;

use crate::config::Config;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bounded-pool handle to the relational store. Cheap to clone; all write
/// paths for durable state go through here.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Builds the connection pool and verifies the server is reachable.
    /// Callers under burst block on pool acquisition rather than fail.
    pub async fn connect(config: &Config) -> StoreResult<Self> {
        let options = PgConnectOptions::new()
            .host(&config.postgres_host)
            .port(config.postgres_port)
            .database(&config.postgres_db)
            .username(&config.postgres_user)
            .password(&config.postgres_password);

        let pool = PgPoolOptions::new()
            .min_connections(config.db_pool_min)
            .max_connections(config.db_pool_max)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&pool).await?;
        tracing::info!(
            host = %config.postgres_host,
            port = config.postgres_port,
            database = %config.postgres_db,
            "database connection pool created"
        );

        Ok(Self { pool })
    }

    /// Wraps an existing pool. Used by tests that manage their own schema.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("database connection pool closed");
    }

    /// Creates tables and indices if absent. Idempotent; never destructive.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        schema::ensure_schema(&self.pool).await
    }
}
