//! JADER adverse-event dataset.
//!
//! One ZIP archive holding per-table CSVs (case demographics, drugs,
//! reactions). File names classify each CSV; Japanese headers map to the
//! target columns, and the repeating sections get sequence keys generated
//! per case when the source omits them.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::btree_map::Entry;
use std::collections::HashMap;
use std::io::Read;
use tracing::{info, warn};

use crate::batch::{DataBatch, NamedBatches, Provenance};
use crate::config::DatasetConfig;
use crate::dates::to_iso_date;
use crate::error::{EtlError, Result};
use crate::fetch::FetchClient;
use crate::schema::{jader_schema, SchemaDef};
use crate::state::Watermark;

use super::{DatasetPipeline, Extraction, RunArgs};

pub struct JaderPipeline;

const DEMO_TABLE: &str = "jader_demo";
const DRUG_TABLE: &str = "jader_drug";
const REAC_TABLE: &str = "jader_reac";

/// Target column order per table, before provenance.
const DEMO_COLUMNS: [&str; 5] = ["case_id", "report_count", "gender", "age", "reporting_quarter"];
const DRUG_COLUMNS: [&str; 5] = ["case_id", "drug_seq", "involvement", "drug_name", "route"];
const REAC_COLUMNS: [&str; 5] = ["case_id", "reac_seq", "adverse_event", "outcome", "onset_date"];

fn header_map(table: &str) -> &'static [(&'static str, &'static str)] {
    match table {
        DEMO_TABLE => &[
            ("識別番号", "case_id"),
            ("報告回数", "report_count"),
            ("性別", "gender"),
            ("年齢", "age"),
            ("報告年度・四半期", "reporting_quarter"),
        ],
        DRUG_TABLE => &[
            ("識別番号", "case_id"),
            ("医薬品連番", "drug_seq"),
            ("医薬品の関与", "involvement"),
            ("医薬品（一般名）", "drug_name"),
            ("投与経路", "route"),
        ],
        _ => &[
            ("識別番号", "case_id"),
            ("有害事象連番", "reac_seq"),
            ("有害事象", "adverse_event"),
            ("転帰", "outcome"),
            ("発現日", "onset_date"),
        ],
    }
}

fn target_columns(table: &str) -> &'static [&'static str] {
    match table {
        DEMO_TABLE => &DEMO_COLUMNS,
        DRUG_TABLE => &DRUG_COLUMNS,
        _ => &REAC_COLUMNS,
    }
}

fn classify(file_name: &str) -> Option<&'static str> {
    let name = file_name.to_ascii_lowercase();
    if name.contains("demo") {
        Some(DEMO_TABLE)
    } else if name.contains("drug") {
        Some(DRUG_TABLE)
    } else if name.contains("reac") {
        Some(REAC_TABLE)
    } else {
        None
    }
}

#[async_trait]
impl DatasetPipeline for JaderPipeline {
    fn target_schema(&self, config: &DatasetConfig) -> SchemaDef {
        jader_schema(&config.schema_name)
    }

    async fn extract(
        &self,
        client: &FetchClient,
        config: &DatasetConfig,
        last_watermark: &Watermark,
        _args: &RunArgs,
    ) -> Result<Extraction> {
        let archive_url = if config.source.archive_url.ends_with(".zip") {
            config.source.archive_url.clone()
        } else {
            let page = client.fetch_text(&config.source.archive_url).await?;
            find_zip_link(&page, &config.source.base_url)?
        };

        let prior = last_watermark.for_url(&archive_url);
        let fetched = client.fetch(&archive_url, &prior).await?;
        let watermark = Watermark::from_files([(archive_url, fetched.watermark.clone())]);

        Ok(Extraction {
            artifacts: vec![fetched],
            watermark,
        })
    }

    fn transform(
        &self,
        _config: &DatasetConfig,
        extraction: &Extraction,
        _args: &RunArgs,
    ) -> Result<NamedBatches> {
        let mut batches = NamedBatches::new();
        for artifact in &extraction.artifacts {
            let provenance = Provenance::new(&artifact.url, &artifact.content_hash);
            let file = std::fs::File::open(&artifact.path)?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| EtlError::Parse(format!("invalid ZIP archive: {e}")))?;

            for index in 0..archive.len() {
                let mut entry = archive
                    .by_index(index)
                    .map_err(|e| EtlError::Parse(format!("unreadable ZIP entry: {e}")))?;
                let entry_name = entry.name().to_string();
                if !entry_name.to_ascii_lowercase().ends_with(".csv") {
                    continue;
                }
                let Some(table) = classify(&entry_name) else {
                    info!(entry = %entry_name, "Skipping unrecognized CSV in archive");
                    continue;
                };

                let mut contents = String::new();
                entry.read_to_string(&mut contents)?;
                let mut batch = parse_case_csv(table, &contents)?;
                if table == REAC_TABLE {
                    batch.map_column("onset_date", |cell| match cell.as_str() {
                        Some(text) => to_iso_date(text)
                            .map(|date| json!(date.to_string()))
                            .unwrap_or(Value::Null),
                        None => Value::Null,
                    });
                }
                batch.attach_provenance(&provenance);
                // Archives can split one table across several CSV members
                match batches.entry(table.to_string()) {
                    Entry::Occupied(mut existing) => existing.get_mut().extend_from(batch)?,
                    Entry::Vacant(slot) => {
                        slot.insert(batch);
                    }
                }
            }
        }

        if batches.is_empty() {
            return Err(EtlError::Parse(
                "archive contained no recognizable case-report tables".to_string(),
            ));
        }
        Ok(batches)
    }
}

fn find_zip_link(html: &str, base_url: &str) -> Result<String> {
    let document = scraper::Html::parse_document(html);
    let anchors = scraper::Selector::parse("a")
        .map_err(|e| EtlError::Parse(format!("invalid selector 'a': {e}")))?;
    for anchor in document.select(&anchors) {
        if let Some(href) = anchor.value().attr("href") {
            if href.to_ascii_lowercase().ends_with(".zip") {
                return super::approvals::resolve_url(base_url, href);
            }
        }
    }
    Err(EtlError::Parse(
        "no case-report archive link found on the download page".to_string(),
    ))
}

/// Parse one case-report CSV into its target columns.
///
/// Headers may be the Japanese originals or already-normalized names.
/// Missing sequence columns are generated as per-case running counters so
/// the composite keys stay stable within a load.
fn parse_case_csv(table: &str, contents: &str) -> Result<DataBatch> {
    let columns = target_columns(table);
    let map = header_map(table);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(contents.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| EtlError::Parse(format!("CSV header error in {table}: {e}")))?
        .clone();

    // source column index -> target column index
    let mut positions: Vec<Option<usize>> = Vec::with_capacity(headers.len());
    for header in headers.iter() {
        let header = header.trim();
        let target = map
            .iter()
            .find(|(jp, _)| header.contains(jp))
            .map(|(_, t)| *t)
            .or_else(|| columns.iter().copied().find(|c| *c == header));
        positions.push(target.and_then(|t| columns.iter().position(|c| *c == t)));
    }
    let case_idx = columns
        .iter()
        .position(|c| *c == "case_id")
        .unwrap_or_default();
    let seq_target = columns.iter().position(|c| c.ends_with("_seq"));
    let seq_mapped = positions.iter().any(|p| *p == seq_target && p.is_some());

    let mut batch = DataBatch::new(columns.iter().copied());
    let mut case_counters: HashMap<String, u64> = HashMap::new();

    for record in reader.records() {
        let record = record.map_err(|e| EtlError::Parse(format!("CSV error in {table}: {e}")))?;
        let mut values = vec![Value::Null; columns.len()];
        for (idx, field) in record.iter().enumerate() {
            let Some(Some(target)) = positions.get(idx) else {
                continue;
            };
            let field = field.trim();
            values[*target] = if field.is_empty() {
                Value::Null
            } else {
                json!(field)
            };
        }
        if values[case_idx].is_null() {
            warn!(table, "Dropping record without a case identifier");
            continue;
        }
        if let (Some(seq_idx), false) = (seq_target, seq_mapped) {
            let case = values[case_idx].as_str().unwrap_or_default().to_string();
            let counter = case_counters.entry(case).or_insert(0);
            *counter += 1;
            values[seq_idx] = json!(counter.to_string());
        }
        batch.push_row(values)?;
    }
    Ok(batch)
}
