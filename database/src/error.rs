//! Database error types.

use thiserror::Error;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

/// Type alias for database results.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

impl From<DatabaseError> for funding_engine::EngineError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(message) => funding_engine::EngineError::validation(message),
            DatabaseError::Conflict(message) => funding_engine::EngineError::validation(message),
            DatabaseError::Crypto(message) => funding_engine::EngineError::auth(message),
            other => funding_engine::EngineError::internal(other.to_string()),
        }
    }
}
