//! Declarative schema definitions consumed by `Loader::ensure_schema`.
//!
//! Column types are written in the PostgreSQL dialect; each adapter maps
//! them to its own type system (`JSONB` → `SUPER` on Redshift, `JSONB` →
//! `VARCHAR` and `TIMESTAMPTZ` → `TIMESTAMP` on DuckDB).

use std::collections::BTreeMap;

use crate::error::{EtlError, Result};

/// Name of the run-state table, one row per dataset.
pub const STATE_TABLE: &str = "ingestion_state";

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
}

impl ColumnDef {
    pub fn new(name: &str, sql_type: &str) -> Self {
        ColumnDef {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TableDef {
    /// Ordered column list; order drives bulk-load encoding.
    pub columns: Vec<ColumnDef>,
    /// Primary key columns; empty means no key constraint.
    pub primary_key: Vec<String>,
}

impl TableDef {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// A schema (namespace) and the tables it must contain.
#[derive(Debug, Clone)]
pub struct SchemaDef {
    pub schema_name: String,
    pub tables: BTreeMap<String, TableDef>,
}

impl SchemaDef {
    pub fn new(schema_name: &str) -> Self {
        SchemaDef {
            schema_name: schema_name.to_string(),
            tables: BTreeMap::new(),
        }
    }

    pub fn with_table(mut self, name: &str, table: TableDef) -> Self {
        self.tables.insert(name.to_string(), table);
        self
    }

    /// Definition of the ephemeral staging copy of `table`: same columns,
    /// no key constraint, named `staging_<table>`.
    pub fn staging_for(&self, table: &str) -> Result<(String, SchemaDef)> {
        let table_def = self.tables.get(table).ok_or_else(|| {
            EtlError::Configuration(format!(
                "schema definition for table '{table}' not found in schema '{}'",
                self.schema_name
            ))
        })?;
        let staging_name = format!("staging_{table}");
        let staging_def = SchemaDef::new(&self.schema_name).with_table(
            &staging_name,
            TableDef {
                columns: table_def.columns.clone(),
                primary_key: Vec::new(),
            },
        );
        Ok((staging_name, staging_def))
    }
}

/// Reject identifiers that would require quoting; everything the pipeline
/// interpolates into SQL goes through this.
pub fn check_ident(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(EtlError::Configuration(format!(
            "invalid SQL identifier: '{name}'"
        )))
    }
}

/// Schema for the run-state store.
pub fn ingestion_state_schema(schema_name: &str) -> SchemaDef {
    SchemaDef::new(schema_name).with_table(
        STATE_TABLE,
        TableDef {
            columns: vec![
                ColumnDef::new("dataset_id", "VARCHAR(100) NOT NULL"),
                ColumnDef::new("last_run_ts_utc", "TIMESTAMPTZ"),
                ColumnDef::new("last_successful_run_ts_utc", "TIMESTAMPTZ"),
                ColumnDef::new("status", "VARCHAR(50)"),
                ColumnDef::new("last_watermark", "JSONB"),
                ColumnDef::new("pipeline_version", "VARCHAR(50)"),
            ],
            primary_key: vec!["dataset_id".to_string()],
        },
    )
}

fn provenance_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("raw_data_full", "JSONB"),
        ColumnDef::new("_meta_load_ts_utc", "TIMESTAMPTZ"),
        ColumnDef::new("_meta_source_content_hash", "VARCHAR(64)"),
        ColumnDef::new("_meta_source_url", "TEXT"),
        ColumnDef::new("_meta_pipeline_version", "VARCHAR(50)"),
    ]
}

/// Target schema for the new-drug-approvals dataset.
pub fn approvals_schema(schema_name: &str, table_name: &str) -> SchemaDef {
    let mut columns = vec![
        ColumnDef::new("approval_id", "VARCHAR(100)"),
        ColumnDef::new("application_type", "VARCHAR(50)"),
        ColumnDef::new("brand_name_jp", "TEXT"),
        ColumnDef::new("generic_name_jp", "TEXT"),
        ColumnDef::new("applicant_name_jp", "TEXT"),
        ColumnDef::new("approval_date", "DATE"),
        ColumnDef::new("indication", "TEXT"),
        ColumnDef::new("review_report_url", "TEXT"),
    ];
    columns.extend(provenance_columns());

    SchemaDef::new(schema_name).with_table(
        table_name,
        TableDef {
            columns,
            primary_key: vec!["approval_id".to_string()],
        },
    )
}

/// Target schema for the JADER adverse-event dataset (one table per
/// case-report section, composite keys on the repeating sections).
pub fn jader_schema(schema_name: &str) -> SchemaDef {
    let demo = {
        let mut columns = vec![
            ColumnDef::new("case_id", "VARCHAR(100) NOT NULL"),
            ColumnDef::new("report_count", "VARCHAR(20)"),
            ColumnDef::new("gender", "VARCHAR(20)"),
            ColumnDef::new("age", "VARCHAR(20)"),
            ColumnDef::new("reporting_quarter", "VARCHAR(20)"),
        ];
        columns.extend(provenance_columns());
        TableDef {
            columns,
            primary_key: vec!["case_id".to_string()],
        }
    };

    let drug = {
        let mut columns = vec![
            ColumnDef::new("case_id", "VARCHAR(100) NOT NULL"),
            ColumnDef::new("drug_seq", "VARCHAR(20) NOT NULL"),
            ColumnDef::new("involvement", "VARCHAR(50)"),
            ColumnDef::new("drug_name", "TEXT"),
            ColumnDef::new("route", "VARCHAR(100)"),
        ];
        columns.extend(provenance_columns());
        TableDef {
            columns,
            primary_key: vec!["case_id".to_string(), "drug_seq".to_string()],
        }
    };

    let reac = {
        let mut columns = vec![
            ColumnDef::new("case_id", "VARCHAR(100) NOT NULL"),
            ColumnDef::new("reac_seq", "VARCHAR(20) NOT NULL"),
            ColumnDef::new("adverse_event", "TEXT"),
            ColumnDef::new("outcome", "VARCHAR(100)"),
            ColumnDef::new("onset_date", "DATE"),
        ];
        columns.extend(provenance_columns());
        TableDef {
            columns,
            primary_key: vec!["case_id".to_string(), "reac_seq".to_string()],
        }
    };

    SchemaDef::new(schema_name)
        .with_table("jader_demo", demo)
        .with_table("jader_drug", drug)
        .with_table("jader_reac", reac)
}
