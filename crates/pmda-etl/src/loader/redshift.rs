//! Amazon Redshift adapter.
//!
//! Speaks the PostgreSQL wire protocol for SQL, but bulk loads go through
//! S3: the batch is staged as a CSV object and pulled in with COPY FROM
//! 's3://…'. Upserts use MERGE, and JSON travels through SUPER columns via
//! JSON_PARSE / JSON_SERIALIZE.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{ConnectOptions, Connection, Row};
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

pub struct RedshiftLoader {
    config: DatabaseConfig,
    bucket: String,
    iam_role: String,
    conn: Option<PgConnection>,
    s3: Option<aws_sdk_s3::Client>,
}

impl RedshiftLoader {
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let bucket = config.s3_staging_bucket.clone().ok_or_else(|| {
            EtlError::Configuration("redshift backend requires s3_staging_bucket".to_string())
        })?;
        let iam_role = config.iam_role.clone().ok_or_else(|| {
            EtlError::Configuration("redshift backend requires iam_role".to_string())
        })?;
        if bucket.contains('\'') || iam_role.contains('\'') {
            return Err(EtlError::Configuration(
                "s3_staging_bucket and iam_role must not contain quotes".to_string(),
            ));
        }
        Ok(RedshiftLoader {
            config,
            bucket,
            iam_role,
            conn: None,
            s3: None,
        })
    }

    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EtlError::Connection("not connected, call connect first".to_string()))
    }
}

/// SUPER replaces JSONB; Redshift has no unbounded TEXT.
fn map_type(sql_type: &str) -> String {
    sql_type
        .replace("JSONB", "SUPER")
        .replace("TEXT", "VARCHAR(65535)")
}

#[async_trait]
impl Loader for RedshiftLoader {
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
        sqlx::query("SET TIME ZONE 'UTC'").execute(&mut conn).await?;
        sqlx::query("BEGIN").execute(&mut conn).await?;

        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        self.s3 = Some(aws_sdk_s3::Client::new(&aws_config));

        info!(
            host = %self.config.host,
            dbname = %self.config.dbname,
            "Connected to Redshift"
        );
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.s3 = None;
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("ROLLBACK").execute(&mut conn).await.ok();
            conn.close().await?;
        }
        Ok(())
    }

    async fn ensure_schema(&mut self, schema: &SchemaDef) -> Result<()> {
        let statements = create_schema_statements(schema, map_type)?;
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
        let csv = batch_to_csv(batch)?;

        let key = format!("pmda-etl/{table}/{}.csv", Uuid::new_v4());
        let s3 = self
            .s3
            .clone()
            .ok_or_else(|| EtlError::Connection("not connected, call connect first".to_string()))?;
        s3.put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(csv))
            .send()
            .await
            .map_err(|e| EtlError::Fetch(format!("S3 staging upload failed: {e}")))?;
        info!(bucket = %self.bucket, key = %key, "Staged batch to S3");

        let copy_sql = format!(
            "COPY {target} ({columns}) FROM 's3://{bucket}/{key}' \
             IAM_ROLE '{role}' FORMAT AS CSV IGNOREHEADER 1 EMPTYASNULL \
             TIMEFORMAT 'auto' DATEFORMAT 'auto'",
            bucket = self.bucket,
            role = self.iam_role,
        );
        let conn = self.conn()?;
        let loaded = async {
            if mode == BulkMode::Overwrite {
                // TRUNCATE commits on Redshift, DELETE keeps the transaction open
                sqlx::query(&format!("DELETE FROM {target}"))
                    .execute(&mut *conn)
                    .await?;
            }
            sqlx::query(&copy_sql).execute(&mut *conn).await?;
            Ok::<(), EtlError>(())
        }
        .await;

        // The staged object is removed whether or not the COPY succeeded
        if let Err(e) = s3
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            warn!(bucket = %self.bucket, key = %key, error = %e, "Could not remove staged S3 object");
        }
        loaded?;

        let rows = batch.len() as u64;
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

        let join = keys
            .iter()
            .map(|k| format!("{target}.{k} = {staging}.{k}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let assignments = update_columns
            .iter()
            .map(|c| format!("{c} = {staging}.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_values = columns
            .iter()
            .map(|c| format!("{staging}.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "MERGE INTO {qualified_target} USING {qualified_staging} ON {join} \
             WHEN MATCHED THEN UPDATE SET {assignments} \
             WHEN NOT MATCHED THEN INSERT ({columns}) VALUES ({insert_values})",
            qualified_target = qualified(schema, target)?,
            qualified_staging = qualified(schema, staging)?,
            columns = column_list(&columns)?,
        );

        match sqlx::query(&sql).execute(&mut *conn).await {
            Ok(_) => {
                info!(schema, target, "Merge complete");
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
             JSON_SERIALIZE(last_watermark) AS last_watermark, pipeline_version \
             FROM {} WHERE dataset_id = $1",
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
             JSON_SERIALIZE(last_watermark) AS last_watermark, pipeline_version \
             FROM {} ORDER BY dataset_id",
            qualified(state_schema, STATE_TABLE)?
        );
        let rows = sqlx::query(&sql).fetch_all(self.conn()?).await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn update_state(&mut self, state_schema: &str, state: &IngestionState) -> Result<()> {
        let table = qualified(state_schema, STATE_TABLE)?;
        let watermark = serde_json::to_string(state.last_watermark.as_value())?;
        let status = state.status.to_string();
        let conn = self.conn()?;

        // No ON CONFLICT on Redshift: UPDATE, then INSERT when nothing matched
        let update_sql = format!(
            "UPDATE {table} SET \
             last_run_ts_utc = $2, \
             last_successful_run_ts_utc = CASE WHEN $4 = 'SUCCESS' \
                 THEN $3 ELSE last_successful_run_ts_utc END, \
             status = $4, \
             last_watermark = JSON_PARSE($5), \
             pipeline_version = $6 \
             WHERE dataset_id = $1"
        );
        let updated = sqlx::query(&update_sql)
            .bind(&state.dataset_id)
            .bind(state.last_run_ts_utc)
            .bind(state.last_successful_run_ts_utc)
            .bind(&status)
            .bind(&watermark)
            .bind(&state.pipeline_version)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        if updated == 0 {
            let insert_sql = format!(
                "INSERT INTO {table} (dataset_id, last_run_ts_utc, last_successful_run_ts_utc, \
                 status, last_watermark, pipeline_version) \
                 VALUES ($1, $2, $3, $4, JSON_PARSE($5), $6)"
            );
            sqlx::query(&insert_sql)
                .bind(&state.dataset_id)
                .bind(state.last_run_ts_utc)
                .bind(state.last_successful_run_ts_utc)
                .bind(&status)
                .bind(&watermark)
                .bind(&state.pipeline_version)
                .execute(&mut *conn)
                .await?;
        }
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
    let watermark: Option<String> = row.try_get("last_watermark")?;
    let watermark = match watermark {
        Some(text) => Watermark::from_value(serde_json::from_str(&text)?),
        None => Watermark::empty(),
    };
    Ok(IngestionState {
        dataset_id: row.try_get("dataset_id")?,
        last_run_ts_utc: row.try_get::<DateTime<Utc>, _>("last_run_ts_utc")?,
        last_successful_run_ts_utc: row.try_get("last_successful_run_ts_utc")?,
        status: status.parse().map_err(EtlError::Parse)?,
        last_watermark: watermark,
        pipeline_version: row.try_get("pipeline_version")?,
    })
}
