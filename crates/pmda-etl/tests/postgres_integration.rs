//! Contract tests against a live PostgreSQL instance.
//!
//! Ignored by default; run with a disposable database:
//!
//! ```text
//! PMDA_TEST_DB_HOST=localhost PMDA_TEST_DB_USER=postgres \
//! PMDA_TEST_DB_PASSWORD=postgres PMDA_TEST_DB_NAME=pmda_test \
//! cargo test -p pmda-etl --test postgres_integration -- --ignored
//! ```

use chrono::{TimeZone, Utc};
use serde_json::json;

use pmda_etl::batch::DataBatch;
use pmda_etl::config::{BackendKind, DatabaseConfig};
use pmda_etl::loader::{BulkMode, Loader, PostgresLoader};
use pmda_etl::schema::{ingestion_state_schema, ColumnDef, SchemaDef, TableDef};
use pmda_etl::state::{IngestionState, RunStatus, Watermark, PIPELINE_VERSION};

fn db_config() -> DatabaseConfig {
    let env = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
    DatabaseConfig {
        backend: BackendKind::Postgres,
        host: env("PMDA_TEST_DB_HOST", "localhost"),
        port: env("PMDA_TEST_DB_PORT", "5432").parse().unwrap(),
        user: env("PMDA_TEST_DB_USER", "postgres"),
        password: Some(env("PMDA_TEST_DB_PASSWORD", "postgres")),
        dbname: env("PMDA_TEST_DB_NAME", "pmda_test"),
        state_schema: "public".to_string(),
        path: None,
        s3_staging_bucket: None,
        iam_role: None,
    }
}

fn items_schema(schema: &str) -> SchemaDef {
    SchemaDef::new(schema).with_table(
        "items",
        TableDef {
            columns: vec![
                ColumnDef::new("id", "INTEGER NOT NULL"),
                ColumnDef::new("name", "TEXT"),
            ],
            primary_key: vec!["id".to_string()],
        },
    )
}

fn items_batch(rows: &[(i64, &str)]) -> DataBatch {
    let mut batch = DataBatch::new(["id", "name"]);
    for (id, name) in rows {
        batch.push_row(vec![json!(id), json!(name)]).unwrap();
    }
    batch
}

#[tokio::test]
#[ignore = "requires a live PostgreSQL instance"]
async fn test_postgres_merge_upserts_staging_over_target() {
    let mut loader = PostgresLoader::new(db_config());
    loader.connect().await.unwrap();

    // Run-scoped schema name keeps repeated test runs independent
    let schema_name = format!("contract_{}", Utc::now().timestamp());
    let schema = items_schema(&schema_name);
    loader.ensure_schema(&schema).await.unwrap();
    loader
        .bulk_load(&schema_name, "items", &items_batch(&[(1, "a"), (2, "b")]), BulkMode::Append)
        .await
        .unwrap();

    let (staging, staging_def) = schema.staging_for("items").unwrap();
    loader.ensure_schema(&staging_def).await.unwrap();
    loader
        .bulk_load(&schema_name, &staging, &items_batch(&[(2, "c"), (3, "d")]), BulkMode::Overwrite)
        .await
        .unwrap();
    loader
        .execute_merge(&schema_name, &staging, "items", &["id".to_string()])
        .await
        .unwrap();
    loader.drop_table(&schema_name, &staging).await.unwrap();

    // Everything stayed in one transaction; roll it back to leave the
    // database clean
    loader.rollback().await.unwrap();
    loader.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a live PostgreSQL instance"]
async fn test_postgres_state_lifecycle() {
    let mut loader = PostgresLoader::new(db_config());
    loader.connect().await.unwrap();

    let schema_name = format!("contract_state_{}", Utc::now().timestamp());
    loader
        .ensure_schema(&ingestion_state_schema(&schema_name))
        .await
        .unwrap();

    assert!(loader
        .get_latest_state(&schema_name, "approvals")
        .await
        .unwrap()
        .is_none());

    let success_ts = Utc.with_ymd_and_hms(2026, 8, 20, 6, 0, 0).unwrap();
    let watermark = Watermark::from_validators(Some("\"v1\""), None, "h1");
    loader
        .update_state(
            &schema_name,
            &IngestionState {
                dataset_id: "approvals".to_string(),
                last_run_ts_utc: success_ts,
                last_successful_run_ts_utc: Some(success_ts),
                status: RunStatus::Success,
                last_watermark: watermark.clone(),
                pipeline_version: PIPELINE_VERSION.to_string(),
            },
        )
        .await
        .unwrap();

    let failed_ts = Utc.with_ymd_and_hms(2026, 8, 21, 6, 0, 0).unwrap();
    loader
        .update_state(
            &schema_name,
            &IngestionState {
                dataset_id: "approvals".to_string(),
                last_run_ts_utc: failed_ts,
                last_successful_run_ts_utc: None,
                status: RunStatus::Failed,
                last_watermark: watermark.clone(),
                pipeline_version: PIPELINE_VERSION.to_string(),
            },
        )
        .await
        .unwrap();

    let state = loader
        .get_latest_state(&schema_name, "approvals")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.last_successful_run_ts_utc, Some(success_ts));
    assert_eq!(state.last_watermark, watermark);

    loader.rollback().await.unwrap();
    loader.disconnect().await.unwrap();
}
