//! PostgreSQL connection management.
//!
//! SQLx pool wrapper with a connectivity probe at startup; migrations
//! run separately so the binary can distinguish an unreachable database
//! from a broken schema.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, DatabaseResult};

/// Database manager owning the connection pool.
pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    /// Connect and verify the database responds.
    pub async fn new(config: DatabaseConfig) -> DatabaseResult<Self> {
        info!("initializing database connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|err| DatabaseError::Connection(err.to_string()))?;

        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&pool)
            .await
            .map_err(|err| DatabaseError::Connection(err.to_string()))?;
        debug!(%version, "connected to PostgreSQL");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Liveness probe.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        let one: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        if one == 1 {
            Ok(())
        } else {
            Err(DatabaseError::Connection(
                "health check returned unexpected result".to_string(),
            ))
        }
    }
}
