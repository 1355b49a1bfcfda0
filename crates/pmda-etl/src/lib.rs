//! Incremental-load engine for PMDA regulatory publications.
//!
//! The pipeline pulls artifacts from the PMDA web portal, detects changes
//! via HTTP validators and content hashes, and loads transformed records
//! into one of three interchangeable SQL backends (PostgreSQL, Redshift,
//! DuckDB) behind a single [`loader::Loader`] contract. Run state lives in
//! the `ingestion_state` table so re-runs are idempotent and failures are
//! observable.

pub mod alert;
pub mod batch;
pub mod config;
pub mod datasets;
pub mod dates;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod orchestrator;
pub mod schema;
pub mod state;
pub mod validator;

pub use error::{EtlError, Result};
