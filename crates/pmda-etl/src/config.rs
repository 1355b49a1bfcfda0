//! Configuration loading: YAML file plus `PMDA_DB_*` environment overrides.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use pmda_common::logging::LogConfig;

use crate::alert::AlerterConfig;
use crate::datasets::DatasetKind;
use crate::error::{EtlError, Result};
use crate::loader::LoadMode;
use crate::validator::Rule;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
const ENV_PREFIX: &str = "PMDA_DB_";

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,
    #[serde(default)]
    pub extractor_settings: FetchSettings,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub alerting: Vec<AlerterConfig>,
}

impl AppConfig {
    pub fn dataset(&self, dataset_id: &str) -> Result<&DatasetConfig> {
        self.datasets.get(dataset_id).ok_or_else(|| {
            EtlError::Configuration(format!(
                "dataset '{dataset_id}' not found in {DEFAULT_CONFIG_FILE}"
            ))
        })
    }
}

/// Which backend family the loader factory should construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    Redshift,
    Duckdb,
}

/// Connection details for the configured backend.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub backend: BackendKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub dbname: String,
    /// Schema holding the `ingestion_state` table.
    #[serde(default = "default_state_schema")]
    pub state_schema: String,
    /// DuckDB only: database file path (`:memory:` for an in-memory run).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Redshift only: S3 bucket staging bulk loads.
    #[serde(default)]
    pub s3_staging_bucket: Option<String>,
    /// Redshift only: IAM role ARN granting COPY access to the bucket.
    #[serde(default)]
    pub iam_role: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_state_schema() -> String {
    "public".to_string()
}

/// Fetch/cache client tuning (the `extractor_settings` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Maximum request attempts per URL
    pub retries: u32,
    /// Backoff base in seconds: retry n sleeps base * 2^(n-1) + jitter
    pub backoff_factor: f64,
    /// Fixed politeness delay before every request, in seconds
    pub rate_limit_seconds: f64,
    /// Per-request timeout, in seconds
    pub timeout_seconds: u64,
    /// Directory for downloaded artifacts, keyed by URL hash
    pub cache_dir: PathBuf,
}

impl Default for FetchSettings {
    fn default() -> Self {
        FetchSettings {
            retries: 3,
            backoff_factor: 0.5,
            rate_limit_seconds: 1.0,
            timeout_seconds: 30,
            cache_dir: PathBuf::from("cache"),
        }
    }
}

/// Per-dataset configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    /// Which extract/parse/transform pipeline to run.
    pub kind: DatasetKind,
    pub schema_name: String,
    #[serde(default = "default_load_mode")]
    pub load_mode: LoadMode,
    /// Target table for single-table datasets.
    #[serde(default)]
    pub table_name: Option<String>,
    /// Primary key for single-table datasets (required for merge mode).
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub validation: Vec<Rule>,
    /// Per-table settings for multi-table datasets.
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
    /// Source URL overrides; defaults point at the PMDA portal.
    #[serde(default)]
    pub source: SourceConfig,
}

fn default_load_mode() -> LoadMode {
    LoadMode::Overwrite
}

impl DatasetConfig {
    /// Primary key columns for a table, falling back to the dataset-level key.
    pub fn primary_keys_for(&self, table: &str) -> &[String] {
        self.tables
            .get(table)
            .filter(|t| !t.primary_key.is_empty())
            .map(|t| t.primary_key.as_slice())
            .unwrap_or(&self.primary_key)
    }

    /// Validation rules for a table, falling back to the dataset-level rules.
    pub fn validation_for(&self, table: &str) -> &[Rule] {
        self.tables
            .get(table)
            .filter(|t| !t.validation.is_empty())
            .map(|t| t.validation.as_slice())
            .unwrap_or(&self.validation)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub validation: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base for resolving relative links found during discovery.
    pub base_url: String,
    /// Page listing per-year approval pages.
    pub index_url: String,
    /// Direct archive URL for single-artifact datasets.
    pub archive_url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            base_url: "https://www.pmda.go.jp".to_string(),
            index_url: "https://www.pmda.go.jp/review-services/drug-reviews/review-information/p-drugs/0010.html".to_string(),
            archive_url: "https://www.pmda.go.jp/safety/info-services/drugs/adr-info/suspected-adr/0005.html".to_string(),
        }
    }
}

/// Load the config file and apply `PMDA_DB_*` environment overrides.
///
/// Postgres and Redshift require a password; it is usually supplied via the
/// `PMDA_DB_PASSWORD` environment variable rather than the file.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    if !path.is_file() {
        return Err(EtlError::Configuration(format!(
            "configuration file not found at {}",
            path.display()
        )));
    }

    let mut app_config: AppConfig = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| EtlError::Configuration(e.to_string()))?;

    apply_env_overrides(&mut app_config.database);

    let needs_password = matches!(
        app_config.database.backend,
        BackendKind::Postgres | BackendKind::Redshift
    );
    if needs_password && app_config.database.password.is_none() {
        return Err(EtlError::Configuration(
            "database password not provided; set the PMDA_DB_PASSWORD environment variable"
                .to_string(),
        ));
    }

    Ok(app_config)
}

fn apply_env_overrides(db: &mut DatabaseConfig) {
    for (key, value) in std::env::vars() {
        let Some(field) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        match field {
            "HOST" => db.host = value,
            "PORT" => {
                if let Ok(port) = value.parse() {
                    db.port = port;
                }
            }
            "USER" => db.user = value,
            "PASSWORD" => db.password = Some(value),
            "DBNAME" => db.dbname = value,
            _ => continue,
        }
        // Never echo credential values
        info!("Overriding database config '{}' from {}", field.to_lowercase(), key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_YAML: &str = r#"
database:
  type: duckdb
  path: ":memory:"
datasets:
  approvals:
    kind: approvals
    schema_name: pmda
    table_name: pmda_approvals
    load_mode: merge
    primary_key: [approval_id]
    validation:
      - column: approval_id
        check: not_null
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_minimal_config() {
        let file = write_config(MINIMAL_YAML);
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.database.backend, BackendKind::Duckdb);
        let ds = config.dataset("approvals").unwrap();
        assert_eq!(ds.load_mode, LoadMode::Merge);
        assert_eq!(ds.primary_keys_for("pmda_approvals"), ["approval_id"]);
        assert_eq!(ds.validation_for("pmda_approvals").len(), 1);
        assert_eq!(config.extractor_settings.retries, 3);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_config(Some(Path::new("/nonexistent/config.yaml"))).unwrap_err();
        assert!(matches!(err, EtlError::Configuration(_)));
    }

    #[test]
    fn test_postgres_without_password_is_rejected() {
        let yaml = r#"
database:
  type: postgres
  host: localhost
  user: etl
  dbname: pmda
"#;
        let file = write_config(yaml);
        // Isolate from an ambient PMDA_DB_PASSWORD
        if std::env::var("PMDA_DB_PASSWORD").is_err() {
            let err = load_config(Some(file.path())).unwrap_err();
            assert!(err.to_string().contains("password"));
        }
    }

    #[test]
    fn test_unknown_dataset() {
        let file = write_config(MINIMAL_YAML);
        let config = load_config(Some(file.path())).unwrap();
        assert!(config.dataset("jader").is_err());
    }
}
