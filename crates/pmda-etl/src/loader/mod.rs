//! Backend adapters behind one loader contract.
//!
//! The orchestrator owns transaction boundaries: adapters open a transaction
//! on `connect` and only ever commit or roll back when told to. `bulk_load`
//! and `execute_merge` must leave the transaction open either way.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::batch::DataBatch;
use crate::config::{BackendKind, DatabaseConfig};
use crate::error::{EtlError, Result};
use crate::schema::{check_ident, SchemaDef, TableDef};
use crate::state::IngestionState;

mod duckdb;
mod postgres;
mod redshift;

pub use duckdb::DuckDbLoader;
pub use postgres::PostgresLoader;
pub use redshift::RedshiftLoader;

/// How `bulk_load` writes into its target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// Insert on top of existing rows.
    Append,
    /// Delete existing rows first, inside the open transaction.
    Overwrite,
}

/// Dataset-level load strategy from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Stage, then upsert by primary key.
    Merge,
    Append,
    Overwrite,
}

/// The contract every backend implements.
///
/// `connect` is idempotent. State methods address the `ingestion_state`
/// table in the given schema; load methods address dataset tables.
#[async_trait]
pub trait Loader: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;

    /// Create the schema and any missing tables. Never alters existing ones.
    async fn ensure_schema(&mut self, schema: &SchemaDef) -> Result<()>;

    /// Load a batch into `schema.table`, returning the row count written.
    /// An empty batch is a no-op, even in overwrite mode.
    async fn bulk_load(
        &mut self,
        schema: &str,
        table: &str,
        batch: &DataBatch,
        mode: BulkMode,
    ) -> Result<u64>;

    /// Upsert `schema.staging` into `schema.target` keyed on `keys`.
    async fn execute_merge(
        &mut self,
        schema: &str,
        staging: &str,
        target: &str,
        keys: &[String],
    ) -> Result<()>;

    async fn drop_table(&mut self, schema: &str, table: &str) -> Result<()>;

    async fn get_latest_state(
        &mut self,
        state_schema: &str,
        dataset_id: &str,
    ) -> Result<Option<IngestionState>>;

    async fn get_all_states(&mut self, state_schema: &str) -> Result<Vec<IngestionState>>;

    /// Upsert one state row. A FAILED status must leave the previous
    /// `last_successful_run_ts_utc` in place.
    async fn update_state(&mut self, state_schema: &str, state: &IngestionState) -> Result<()>;

    /// Commit the open transaction and begin a new one.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction and begin a new one.
    async fn rollback(&mut self) -> Result<()>;
}

/// Construct the adapter for the configured backend.
pub fn loader_for(config: &DatabaseConfig) -> Result<Box<dyn Loader>> {
    Ok(match config.backend {
        BackendKind::Postgres => Box::new(PostgresLoader::new(config.clone())),
        BackendKind::Redshift => Box::new(RedshiftLoader::new(config.clone())?),
        BackendKind::Duckdb => Box::new(DuckDbLoader::new(config.clone())),
    })
}

// ---------------------------------------------------------------------------
// Shared SQL assembly. Identifiers always pass through check_ident before
// interpolation; values always travel as bind parameters or COPY payloads.
// ---------------------------------------------------------------------------

pub(crate) fn qualified(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", check_ident(schema)?, check_ident(table)?))
}

pub(crate) fn column_list(columns: &[String]) -> Result<String> {
    let mut checked = Vec::with_capacity(columns.len());
    for column in columns {
        checked.push(check_ident(column)?);
    }
    Ok(checked.join(", "))
}

/// CREATE TABLE IF NOT EXISTS with backend-specific type mapping.
pub(crate) fn create_table_sql(
    schema_name: &str,
    table_name: &str,
    table: &TableDef,
    map_type: impl Fn(&str) -> String,
) -> Result<String> {
    let mut parts = Vec::with_capacity(table.columns.len() + 1);
    for column in &table.columns {
        parts.push(format!("{} {}", check_ident(&column.name)?, map_type(&column.sql_type)));
    }
    if !table.primary_key.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", column_list(&table.primary_key)?));
    }
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified(schema_name, table_name)?,
        parts.join(", ")
    ))
}

pub(crate) fn create_schema_statements(
    schema: &SchemaDef,
    map_type: impl Fn(&str) -> String,
) -> Result<Vec<String>> {
    let mut statements = vec![format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        check_ident(&schema.schema_name)?
    )];
    for (table_name, table) in &schema.tables {
        statements.push(create_table_sql(
            &schema.schema_name,
            table_name,
            table,
            &map_type,
        )?);
    }
    Ok(statements)
}

/// Columns to assign during a merge: everything that is not a key.
/// Returns None when there is nothing to do, which the caller logs and skips.
pub(crate) fn merge_update_columns(all: &[String], keys: &[String]) -> Option<Vec<String>> {
    if all.is_empty() {
        warn!("Staging table has no columns, skipping merge");
        return None;
    }
    let update: Vec<String> = all
        .iter()
        .filter(|c| !keys.contains(c))
        .cloned()
        .collect();
    if update.is_empty() {
        warn!("All columns are key columns, nothing to update, skipping merge");
        return None;
    }
    Some(update)
}

/// Render a cell for text-based bulk encodings. None means SQL NULL.
/// Objects and arrays are serialized as JSON.
pub(crate) fn cell_text(value: &Value) -> Result<Option<String>> {
    Ok(match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(serde_json::to_string(other)?),
    })
}

/// Encode a batch as CSV with a header row; NULL cells become empty fields.
pub(crate) fn batch_to_csv(batch: &DataBatch) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(batch.columns())
        .map_err(|e| EtlError::Parse(format!("CSV encode failed: {e}")))?;
    for row in batch.rows() {
        let mut record = Vec::with_capacity(row.len());
        for cell in row {
            record.push(cell_text(cell)?.unwrap_or_default());
        }
        writer
            .write_record(&record)
            .map_err(|e| EtlError::Parse(format!("CSV encode failed: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| EtlError::Parse(format!("CSV encode failed: {e}")))
}
