//! The run state machine.
//!
//! One invocation loads one dataset: connect, ensure schemas, read prior
//! state, extract, compare watermarks, then either stop (unchanged) or
//! transform-validate-load and record state. The orchestrator owns the
//! transaction: adapters never commit on their own, and any stage failure
//! rolls everything back before the FAILED state is written in a fresh
//! transaction.

use chrono::Utc;
use tracing::{error, info};

use crate::alert::AlertManager;
use crate::batch::DataBatch;
use crate::config::{AppConfig, DatasetConfig};
use crate::datasets::{pipeline_for, RunArgs};
use crate::error::{EtlError, Result};
use crate::fetch::FetchClient;
use crate::loader::{loader_for, BulkMode, LoadMode, Loader};
use crate::schema::{ingestion_state_schema, SchemaDef};
use crate::state::{IngestionState, RunStatus, Watermark, PIPELINE_VERSION};
use crate::validator::DataValidator;

/// What a run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Watermark matched the stored one; nothing was parsed or loaded.
    Unchanged,
    Loaded { tables: usize, rows: u64 },
}

pub struct Orchestrator {
    config: AppConfig,
    alerts: AlertManager,
}

impl Orchestrator {
    pub fn new(config: AppConfig) -> Self {
        let alerts = AlertManager::from_config(&config.alerting);
        Orchestrator { config, alerts }
    }

    /// Create the state table and every configured dataset's target schema.
    pub async fn init_db(&self) -> Result<()> {
        let mut loader = loader_for(&self.config.database)?;
        loader.connect().await?;
        let result = async {
            loader
                .ensure_schema(&ingestion_state_schema(&self.config.database.state_schema))
                .await?;
            for dataset in self.config.datasets.values() {
                let pipeline = pipeline_for(dataset.kind);
                loader.ensure_schema(&pipeline.target_schema(dataset)).await?;
            }
            loader.commit().await
        }
        .await;
        if result.is_err() {
            loader.rollback().await.ok();
        }
        loader.disconnect().await?;
        result
    }

    /// Read every dataset's run state.
    pub async fn status(&self) -> Result<Vec<IngestionState>> {
        let state_schema = &self.config.database.state_schema;
        let mut loader = loader_for(&self.config.database)?;
        loader.connect().await?;
        let result = async {
            loader.ensure_schema(&ingestion_state_schema(state_schema)).await?;
            loader.get_all_states(state_schema).await
        }
        .await;
        loader.disconnect().await?;
        result
    }

    /// Run one dataset end to end.
    pub async fn run(
        &self,
        dataset_id: &str,
        mode_override: Option<LoadMode>,
        args: &RunArgs,
    ) -> Result<RunOutcome> {
        let dataset = self.config.dataset(dataset_id)?.clone();
        let mode = mode_override.unwrap_or(dataset.load_mode);
        if mode == LoadMode::Merge {
            check_merge_keys(dataset_id, &dataset)?;
        }
        let pipeline = pipeline_for(dataset.kind);
        let client = FetchClient::new(self.config.extractor_settings.clone())?;
        let state_schema = self.config.database.state_schema.clone();

        let mut loader = loader_for(&self.config.database)?;
        loader.connect().await?;

        // Kept for the failure path so a failed run never clobbers the
        // stored watermark.
        let mut prior_watermark = Watermark::empty();

        let result: Result<RunOutcome> = async {
            loader
                .ensure_schema(&ingestion_state_schema(&state_schema))
                .await?;

            // Read prior state before any other stage can fail, so the
            // FAILED record always carries the stored watermark
            let last_state = loader.get_latest_state(&state_schema, dataset_id).await?;
            let last_watermark = last_state
                .map(|s| s.last_watermark)
                .unwrap_or_else(Watermark::empty);
            prior_watermark = last_watermark.clone();

            let target_schema = pipeline.target_schema(&dataset);
            loader.ensure_schema(&target_schema).await?;

            info!(dataset_id, "Starting extraction");
            let extraction = pipeline
                .extract(&client, &dataset, &last_watermark, args)
                .await?;

            if extraction.watermark == last_watermark && !last_watermark.is_empty() {
                info!(dataset_id, "Source unchanged since last run, skipping load");
                record_success(loader.as_mut(), &state_schema, dataset_id, extraction.watermark)
                    .await?;
                return Ok(RunOutcome::Unchanged);
            }

            let batches = pipeline.transform(&dataset, &extraction, args)?;

            let mut total_rows = 0u64;
            let mut tables = 0usize;
            for (table, batch) in &batches {
                let rows = self
                    .load_table(loader.as_mut(), &dataset, &target_schema, table, batch, mode)
                    .await?;
                if rows > 0 {
                    tables += 1;
                    total_rows += rows;
                }
            }

            record_success(loader.as_mut(), &state_schema, dataset_id, extraction.watermark)
                .await?;
            Ok(RunOutcome::Loaded {
                tables,
                rows: total_rows,
            })
        }
        .await;

        match result {
            Ok(outcome) => {
                loader.disconnect().await?;
                info!(dataset_id, ?outcome, "Run finished");
                Ok(outcome)
            }
            Err(err) => {
                error!(dataset_id, error = %err, "Run failed, rolling back");
                loader.rollback().await.ok();
                self.alerts
                    .send(&format!("PMDA load failed: {dataset_id}"), &err.to_string())
                    .await;

                let failed = IngestionState {
                    dataset_id: dataset_id.to_string(),
                    last_run_ts_utc: Utc::now(),
                    last_successful_run_ts_utc: None,
                    status: RunStatus::Failed,
                    last_watermark: prior_watermark,
                    pipeline_version: PIPELINE_VERSION.to_string(),
                };
                let recorded = async {
                    loader.update_state(&state_schema, &failed).await?;
                    loader.commit().await
                }
                .await;
                if let Err(record_err) = recorded {
                    error!(dataset_id, error = %record_err, "Could not record FAILED state");
                }
                loader.disconnect().await.ok();
                Err(err)
            }
        }
    }

    /// Validate and load one batch, honoring the load mode.
    async fn load_table(
        &self,
        loader: &mut dyn Loader,
        dataset: &DatasetConfig,
        target_schema: &SchemaDef,
        table: &str,
        batch: &DataBatch,
        mode: LoadMode,
    ) -> Result<u64> {
        if batch.is_empty() {
            info!(table, "Transformed batch is empty, skipping load");
            return Ok(0);
        }

        let mut validator = DataValidator::new(dataset.validation_for(table).to_vec());
        if !validator.validate(batch) {
            return Err(EtlError::Validation {
                table: table.to_string(),
                details: validator.errors.join("\n"),
            });
        }

        let schema_name = &dataset.schema_name;
        match mode {
            LoadMode::Append => {
                loader
                    .bulk_load(schema_name, table, batch, BulkMode::Append)
                    .await
            }
            LoadMode::Overwrite => {
                loader
                    .bulk_load(schema_name, table, batch, BulkMode::Overwrite)
                    .await
            }
            LoadMode::Merge => {
                let keys = dataset.primary_keys_for(table);
                if keys.is_empty() {
                    return Err(EtlError::Configuration(format!(
                        "merge mode requires primary keys for table '{table}'"
                    )));
                }
                let (staging, staging_def) = target_schema.staging_for(table)?;
                loader.ensure_schema(&staging_def).await?;
                let rows = loader
                    .bulk_load(schema_name, &staging, batch, BulkMode::Overwrite)
                    .await?;
                // The staging drop runs whether or not the merge succeeded
                let merged = loader.execute_merge(schema_name, &staging, table, keys).await;
                let dropped = loader.drop_table(schema_name, &staging).await;
                merged?;
                dropped?;
                Ok(rows)
            }
        }
    }
}

async fn record_success(
    loader: &mut dyn Loader,
    state_schema: &str,
    dataset_id: &str,
    watermark: Watermark,
) -> Result<()> {
    let now = Utc::now();
    let state = IngestionState {
        dataset_id: dataset_id.to_string(),
        last_run_ts_utc: now,
        last_successful_run_ts_utc: Some(now),
        status: RunStatus::Success,
        last_watermark: watermark,
        pipeline_version: PIPELINE_VERSION.to_string(),
    };
    loader.update_state(state_schema, &state).await?;
    loader.commit().await
}

/// Merge mode must be rejected before any network or database call when no
/// primary keys are configured anywhere for the dataset.
fn check_merge_keys(dataset_id: &str, dataset: &DatasetConfig) -> Result<()> {
    let has_keys = !dataset.primary_key.is_empty()
        || dataset.tables.values().any(|t| !t.primary_key.is_empty());
    if has_keys {
        Ok(())
    } else {
        Err(EtlError::Configuration(format!(
            "dataset '{dataset_id}' is configured for merge but defines no primary keys"
        )))
    }
}
