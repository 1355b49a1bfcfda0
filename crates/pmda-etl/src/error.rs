//! Error types for the ETL core.

use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Error taxonomy for the pipeline.
///
/// Transient HTTP failures are retried inside the fetch client; everything
/// surfacing here propagates to the orchestrator, which rolls back, alerts,
/// and re-raises.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Backend unreachable or misconfigured
    #[error("connection error: {0}")]
    Connection(String),

    /// Missing or inconsistent configuration (e.g. merge without primary key)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// HTTP retries exhausted or a non-retryable response
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Data-quality rule failure, raised before any load call
    #[error("data validation failed for table '{table}':\n{details}")]
    Validation { table: String, details: String },

    /// Backend-specific SQL failure during upsert
    #[error("merge into '{table}' failed: {source}")]
    Merge {
        table: String,
        #[source]
        source: Box<EtlError>,
    },

    /// Artifact could not be parsed into tabular data
    #[error("parse error: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EtlError {
    /// Wrap a backend error as a merge failure for the given target table.
    pub fn merge(table: &str, source: EtlError) -> Self {
        EtlError::Merge {
            table: table.to_string(),
            source: Box::new(source),
        }
    }
}
