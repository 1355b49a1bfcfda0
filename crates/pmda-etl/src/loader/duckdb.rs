//! DuckDB adapter, the embedded warehouse backend.
//!
//! Calls are synchronous; the engine runs in-process. Bulk loads spill the
//! batch to a temporary CSV file and COPY it in, mirroring the file-based
//! ingestion paths of the server backends. JSONB maps to VARCHAR and
//! TIMESTAMPTZ to TIMESTAMP, with all timestamps stored as UTC wall time.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::Connection;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::DataBatch;
use crate::config::DatabaseConfig;
use crate::error::{EtlError, Result};
use crate::schema::{SchemaDef, STATE_TABLE};
use crate::state::{IngestionState, Watermark};

use super::{
    batch_to_csv, column_list, create_schema_statements, merge_update_columns, qualified,
    BulkMode, Loader,
};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub struct DuckDbLoader {
    config: DatabaseConfig,
    conn: Option<Connection>,
}

impl DuckDbLoader {
    pub fn new(config: DatabaseConfig) -> Self {
        DuckDbLoader { config, conn: None }
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| EtlError::Connection("not connected, call connect first".to_string()))
    }
}

fn map_type(sql_type: &str) -> String {
    sql_type
        .replace("JSONB", "VARCHAR")
        .replace("TIMESTAMPTZ", "TIMESTAMP")
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.naive_utc().format(TS_FORMAT).to_string()
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| EtlError::Parse(format!("invalid stored timestamp '{text}': {e}")))
}

#[async_trait]
impl Loader for DuckDbLoader {
    async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let path = self
            .config
            .path
            .clone()
            .unwrap_or_else(|| "pmda.duckdb".into());
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(&path)?
        };
        conn.execute_batch("BEGIN TRANSACTION")?;
        info!(path = %path.display(), "Opened DuckDB database");
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.execute_batch("ROLLBACK").ok();
        }
        Ok(())
    }

    async fn ensure_schema(&mut self, schema: &SchemaDef) -> Result<()> {
        let statements = create_schema_statements(schema, map_type)?;
        let conn = self.conn()?;
        for statement in statements {
            conn.execute_batch(&statement)?;
        }
        Ok(())
    }

    async fn bulk_load(
        &mut self,
        schema: &str,
        table: &str,
        batch: &DataBatch,
        mode: BulkMode,
    ) -> Result<u64> {
        if batch.is_empty() {
            warn!(schema, table, "No data to load");
            return Ok(0);
        }
        let target = qualified(schema, table)?;
        let columns = column_list(batch.columns())?;
        let csv = batch_to_csv(batch)?;

        let spill = std::env::temp_dir().join(format!("pmda-etl-{}.csv", Uuid::new_v4()));
        std::fs::write(&spill, &csv)?;

        let conn = self.conn()?;
        let outcome = (|| -> Result<u64> {
            if mode == BulkMode::Overwrite {
                conn.execute(&format!("DELETE FROM {target}"), [])?;
            }
            let copy_sql = format!(
                "COPY {target} ({columns}) FROM '{}' (FORMAT CSV, HEADER)",
                spill.display().to_string().replace('\'', "''")
            );
            Ok(conn.execute(&copy_sql, [])? as u64)
        })();
        std::fs::remove_file(&spill).ok();

        let rows = outcome?;
        info!(schema, table, rows, "Bulk load complete");
        Ok(rows)
    }

    async fn execute_merge(
        &mut self,
        schema: &str,
        staging: &str,
        target: &str,
        keys: &[String],
    ) -> Result<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
        )?;
        let columns = stmt
            .query_map(duckdb::params![schema, staging], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<String>, duckdb::Error>>()?;

        let Some(update_columns) = merge_update_columns(&columns, keys) else {
            return Ok(());
        };

        let assignments = update_columns
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {target} ({columns}) SELECT {columns} FROM {staging} \
             ON CONFLICT ({keys}) DO UPDATE SET {assignments}",
            target = qualified(schema, target)?,
            staging = qualified(schema, staging)?,
            columns = column_list(&columns)?,
            keys = column_list(keys)?,
        );

        match conn.execute_batch(&sql) {
            Ok(()) => {
                info!(schema, target, "Merge complete");
                Ok(())
            }
            Err(e) => Err(EtlError::merge(target, e.into())),
        }
    }

    async fn drop_table(&mut self, schema: &str, table: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", qualified(schema, table)?);
        self.conn()?.execute_batch(&sql)?;
        Ok(())
    }

    async fn get_latest_state(
        &mut self,
        state_schema: &str,
        dataset_id: &str,
    ) -> Result<Option<IngestionState>> {
        let sql = format!(
            "SELECT dataset_id, CAST(last_run_ts_utc AS VARCHAR), \
             CAST(last_successful_run_ts_utc AS VARCHAR), status, last_watermark, \
             pipeline_version FROM {} WHERE dataset_id = ?",
            qualified(state_schema, STATE_TABLE)?
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(duckdb::params![dataset_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(state_from_row(row)?)),
            None => Ok(None),
        }
    }

    async fn get_all_states(&mut self, state_schema: &str) -> Result<Vec<IngestionState>> {
        let sql = format!(
            "SELECT dataset_id, CAST(last_run_ts_utc AS VARCHAR), \
             CAST(last_successful_run_ts_utc AS VARCHAR), status, last_watermark, \
             pipeline_version FROM {} ORDER BY dataset_id",
            qualified(state_schema, STATE_TABLE)?
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut states = Vec::new();
        while let Some(row) = rows.next()? {
            states.push(state_from_row(row)?);
        }
        Ok(states)
    }

    async fn update_state(&mut self, state_schema: &str, state: &IngestionState) -> Result<()> {
        let table = qualified(state_schema, STATE_TABLE)?;
        let sql = format!(
            "INSERT INTO {table} (dataset_id, last_run_ts_utc, last_successful_run_ts_utc, \
             status, last_watermark, pipeline_version) \
             VALUES (?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP), ?, ?, ?) \
             ON CONFLICT (dataset_id) DO UPDATE SET \
             last_run_ts_utc = EXCLUDED.last_run_ts_utc, \
             last_successful_run_ts_utc = CASE WHEN EXCLUDED.status = 'SUCCESS' \
                 THEN EXCLUDED.last_successful_run_ts_utc \
                 ELSE last_successful_run_ts_utc END, \
             status = EXCLUDED.status, \
             last_watermark = EXCLUDED.last_watermark, \
             pipeline_version = EXCLUDED.pipeline_version"
        );
        let watermark = serde_json::to_string(state.last_watermark.as_value())?;
        self.conn()?.execute(
            &sql,
            duckdb::params![
                state.dataset_id,
                format_ts(state.last_run_ts_utc),
                state.last_successful_run_ts_utc.map(format_ts),
                state.status.to_string(),
                watermark,
                state.pipeline_version,
            ],
        )?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("COMMIT")?;
        conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("ROLLBACK")?;
        conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }
}

fn state_from_row(row: &duckdb::Row<'_>) -> Result<IngestionState> {
    let last_run: String = row.get(1)?;
    let last_success: Option<String> = row.get(2)?;
    let status: String = row.get(3)?;
    let watermark: Option<String> = row.get(4)?;
    Ok(IngestionState {
        dataset_id: row.get(0)?,
        last_run_ts_utc: parse_ts(&last_run)?,
        last_successful_run_ts_utc: last_success.as_deref().map(parse_ts).transpose()?,
        status: status.parse().map_err(EtlError::Parse)?,
        last_watermark: match watermark {
            Some(text) => Watermark::from_value(serde_json::from_str(&text)?),
            None => Watermark::empty(),
        },
        pipeline_version: row.get(5)?,
    })
}
