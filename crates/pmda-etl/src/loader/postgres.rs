//! PostgreSQL adapter: COPY FROM STDIN bulk loads and ON CONFLICT merges.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{ConnectOptions, Connection, Row};
use tracing::{info, warn};

use crate::batch::DataBatch;
use crate::config::DatabaseConfig;
use crate::error::{EtlError, Result};
use crate::schema::{SchemaDef, STATE_TABLE};
use crate::state::{IngestionState, Watermark};

use super::{
    column_list, create_schema_statements, merge_update_columns, qualified, BulkMode, Loader,
};

pub struct PostgresLoader {
    config: DatabaseConfig,
    conn: Option<PgConnection>,
}

impl PostgresLoader {
    pub fn new(config: DatabaseConfig) -> Self {
        PostgresLoader { config, conn: None }
    }

    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EtlError::Connection("not connected, call connect first".to_string()))
    }
}

#[async_trait]
impl Loader for PostgresLoader {
    async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let mut options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .database(&self.config.dbname);
        if let Some(password) = &self.config.password {
            options = options.password(password);
        }
        let mut conn = options
            .connect()
            .await
            .map_err(|e| EtlError::Connection(e.to_string()))?;
        // Session-level, set before BEGIN so a rollback cannot revert it
        sqlx::query("SET TIME ZONE 'UTC'").execute(&mut conn).await?;
        sqlx::query("BEGIN").execute(&mut conn).await?;
        info!(
            host = %self.config.host,
            dbname = %self.config.dbname,
            "Connected to PostgreSQL"
        );
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            // Closing rolls back anything uncommitted
            sqlx::query("ROLLBACK").execute(&mut conn).await.ok();
            conn.close().await?;
        }
        Ok(())
    }

    async fn ensure_schema(&mut self, schema: &SchemaDef) -> Result<()> {
        let statements = create_schema_statements(schema, |t| t.to_string())?;
        let conn = self.conn()?;
        for statement in statements {
            sqlx::query(&statement).execute(&mut *conn).await?;
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
        let payload = encode_copy_payload(batch)?;
        let conn = self.conn()?;

        if mode == BulkMode::Overwrite {
            sqlx::query(&format!("DELETE FROM {target}"))
                .execute(&mut *conn)
                .await?;
        }

        let copy_sql = format!("COPY {target} ({columns}) FROM STDIN WITH (FORMAT text, NULL '')");
        let mut copy = conn.copy_in_raw(&copy_sql).await?;
        copy.send(payload.as_bytes()).await?;
        let rows = copy.finish().await?;
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
        let columns: Vec<String> = sqlx::query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(staging)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|row| row.get(0))
        .collect();

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

        let outcome = sqlx::query(&sql).execute(&mut *conn).await;
        match outcome {
            Ok(result) => {
                info!(schema, target, rows = result.rows_affected(), "Merge complete");
                Ok(())
            }
            Err(e) => Err(EtlError::merge(target, e.into())),
        }
    }

    async fn drop_table(&mut self, schema: &str, table: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", qualified(schema, table)?);
        sqlx::query(&sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn get_latest_state(
        &mut self,
        state_schema: &str,
        dataset_id: &str,
    ) -> Result<Option<IngestionState>> {
        let sql = format!(
            "SELECT dataset_id, last_run_ts_utc, last_successful_run_ts_utc, status, \
             last_watermark, pipeline_version FROM {} WHERE dataset_id = $1",
            qualified(state_schema, STATE_TABLE)?
        );
        let row = sqlx::query(&sql)
            .bind(dataset_id)
            .fetch_optional(self.conn()?)
            .await?;
        row.map(|r| state_from_row(&r)).transpose()
    }

    async fn get_all_states(&mut self, state_schema: &str) -> Result<Vec<IngestionState>> {
        let sql = format!(
            "SELECT dataset_id, last_run_ts_utc, last_successful_run_ts_utc, status, \
             last_watermark, pipeline_version FROM {} ORDER BY dataset_id",
            qualified(state_schema, STATE_TABLE)?
        );
        let rows = sqlx::query(&sql).fetch_all(self.conn()?).await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn update_state(&mut self, state_schema: &str, state: &IngestionState) -> Result<()> {
        let table = qualified(state_schema, STATE_TABLE)?;
        let sql = format!(
            "INSERT INTO {table} (dataset_id, last_run_ts_utc, last_successful_run_ts_utc, \
             status, last_watermark, pipeline_version) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (dataset_id) DO UPDATE SET \
             last_run_ts_utc = EXCLUDED.last_run_ts_utc, \
             last_successful_run_ts_utc = CASE WHEN EXCLUDED.status = 'SUCCESS' \
                 THEN EXCLUDED.last_successful_run_ts_utc \
                 ELSE {table}.last_successful_run_ts_utc END, \
             status = EXCLUDED.status, \
             last_watermark = EXCLUDED.last_watermark, \
             pipeline_version = EXCLUDED.pipeline_version"
        );
        sqlx::query(&sql)
            .bind(&state.dataset_id)
            .bind(state.last_run_ts_utc)
            .bind(state.last_successful_run_ts_utc)
            .bind(state.status.to_string())
            .bind(state.last_watermark.as_value())
            .bind(&state.pipeline_version)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let conn = self.conn()?;
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let conn = self.conn()?;
        sqlx::query("ROLLBACK").execute(&mut *conn).await?;
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        Ok(())
    }
}

fn state_from_row(row: &PgRow) -> Result<IngestionState> {
    let status: String = row.try_get("status")?;
    let watermark: Option<Value> = row.try_get("last_watermark")?;
    Ok(IngestionState {
        dataset_id: row.try_get("dataset_id")?,
        last_run_ts_utc: row.try_get::<DateTime<Utc>, _>("last_run_ts_utc")?,
        last_successful_run_ts_utc: row.try_get("last_successful_run_ts_utc")?,
        status: status.parse().map_err(EtlError::Parse)?,
        last_watermark: watermark.map(Watermark::from_value).unwrap_or_default(),
        pipeline_version: row.try_get("pipeline_version")?,
    })
}

/// Encode a batch in COPY text format: tab-delimited, NULL as the empty
/// string (matching the `NULL ''` COPY option), with backslash escapes.
fn encode_copy_payload(batch: &DataBatch) -> Result<String> {
    let mut payload = String::new();
    for row in batch.rows() {
        let mut cells = Vec::with_capacity(row.len());
        for cell in row {
            cells.push(match super::cell_text(cell)? {
                Some(text) => escape_copy_text(&text),
                None => String::new(),
            });
        }
        payload.push_str(&cells.join("\t"));
        payload.push('\n');
    }
    Ok(payload)
}

fn escape_copy_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\t' => escaped.push_str("\\t"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_copy_payload() {
        let mut batch = DataBatch::new(["id", "note"]);
        batch
            .push_row(vec![json!(1), json!("line1\nline2\twith\\slash")])
            .unwrap();
        batch.push_row(vec![json!(2), json!(null)]).unwrap();
        let payload = encode_copy_payload(&batch).unwrap();
        assert_eq!(payload, "1\tline1\\nline2\\twith\\\\slash\n2\t\n");
    }

    #[test]
    fn test_json_cells_serialize_inline() {
        let mut batch = DataBatch::new(["raw"]);
        batch.push_row(vec![json!({"a": 1})]).unwrap();
        let payload = encode_copy_payload(&batch).unwrap();
        assert_eq!(payload, "{\"a\":1}\n");
    }
}
