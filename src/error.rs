use thiserror::Error;

use crate::db::StructuredError;

/// Errors raised while compiling filters or talking to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A join was requested towards a store that is not linked.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The filter cannot be expressed for the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Malformed filter values, e.g. temporal bounds.
    #[error("invalid filter: {0}")]
    Validation(String),

    /// Failure reported by PostgreSQL while executing statements.
    #[error("{0}")]
    Execution(StructuredError),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("failed to create connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("connection pool is closed")]
    Closed,
}

impl StoreError {
    pub fn no_linked_store(store: &str) -> Self {
        StoreError::Configuration(format!("No linked {} store", store))
    }

    /// Wrap a driver error, keeping the statement text for position info.
    pub fn execution(err: &tokio_postgres::Error, query: &str) -> Self {
        StoreError::Execution(StructuredError::from_pg_error(err, query))
    }

    /// Whether resubmitting the same work may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Execution(e) => e.is_transient(),
            StoreError::Pool(_) => true,
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
