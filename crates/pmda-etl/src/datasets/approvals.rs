//! New-drug-approvals dataset.
//!
//! Discovery is two-step: the index page links one listing page per fiscal
//! year (anchor text `<year>年度`), and that page carries an HTML table of
//! approvals. The year page is the cached artifact; its validators form the
//! watermark.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use tracing::warn;

use crate::batch::{DataBatch, NamedBatches, Provenance};
use crate::config::DatasetConfig;
use crate::dates::to_iso_date;
use crate::error::{EtlError, Result};
use crate::fetch::FetchClient;
use crate::schema::{approvals_schema, SchemaDef};
use crate::state::Watermark;

use super::{DatasetPipeline, Extraction, RunArgs};

const DEFAULT_TABLE: &str = "pmda_approvals";

/// Listing-table columns, in target order (provenance is appended later).
const COLUMNS: [&str; 8] = [
    "approval_id",
    "application_type",
    "brand_name_jp",
    "generic_name_jp",
    "applicant_name_jp",
    "approval_date",
    "indication",
    "review_report_url",
];

pub struct ApprovalsPipeline;

fn table_name(config: &DatasetConfig) -> String {
    config
        .table_name
        .clone()
        .unwrap_or_else(|| DEFAULT_TABLE.to_string())
}

#[async_trait]
impl DatasetPipeline for ApprovalsPipeline {
    fn target_schema(&self, config: &DatasetConfig) -> SchemaDef {
        approvals_schema(&config.schema_name, &table_name(config))
    }

    async fn extract(
        &self,
        client: &FetchClient,
        config: &DatasetConfig,
        last_watermark: &Watermark,
        args: &RunArgs,
    ) -> Result<Extraction> {
        let year = args.year.ok_or_else(|| {
            EtlError::Configuration("the approvals dataset requires --year".to_string())
        })?;

        let index_html = client.fetch_text(&config.source.index_url).await?;
        let year_url = find_year_link(&index_html, &config.source.base_url, year)?;

        let prior = last_watermark.for_url(&year_url);
        let fetched = client.fetch(&year_url, &prior).await?;
        let watermark = Watermark::from_files([(year_url, fetched.watermark.clone())]);

        Ok(Extraction {
            artifacts: vec![fetched],
            watermark,
        })
    }

    fn transform(
        &self,
        config: &DatasetConfig,
        extraction: &Extraction,
        args: &RunArgs,
    ) -> Result<NamedBatches> {
        let mut combined: Option<DataBatch> = None;
        for artifact in &extraction.artifacts {
            let html = std::fs::read_to_string(&artifact.path)?;
            let mut parsed = parse_listing_table(&html, &config.source.base_url)?;

            if !args.drug_names.is_empty() {
                retain_matching_drugs(&mut parsed, &args.drug_names);
            }
            parsed.map_column("approval_date", |cell| match cell.as_str() {
                Some(text) => match to_iso_date(text) {
                    Some(date) => json!(date.to_string()),
                    None => {
                        warn!(value = text, "Unparseable approval date, storing NULL");
                        Value::Null
                    }
                },
                None => Value::Null,
            });
            parsed.attach_provenance(&Provenance::new(&artifact.url, &artifact.content_hash));

            match &mut combined {
                None => combined = Some(parsed),
                Some(batch) => {
                    for row in parsed.rows() {
                        batch.push_row(row.clone())?;
                    }
                }
            }
        }

        let mut batches = NamedBatches::new();
        batches.insert(
            table_name(config),
            combined.unwrap_or_else(|| DataBatch::new(COLUMNS)),
        );
        Ok(batches)
    }
}

fn retain_matching_drugs(batch: &mut DataBatch, drug_names: &[String]) {
    let brand = batch.column_index("brand_name_jp");
    let generic = batch.column_index("generic_name_jp");
    batch.retain_rows(|row| {
        [brand, generic].iter().flatten().any(|&idx| {
            row[idx]
                .as_str()
                .is_some_and(|text| drug_names.iter().any(|name| text.contains(name)))
        })
    });
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| EtlError::Parse(format!("invalid selector '{css}': {e}")))
}

/// Find the link whose anchor text names the requested fiscal year.
fn find_year_link(html: &str, base_url: &str, year: i32) -> Result<String> {
    let document = Html::parse_document(html);
    let anchors = selector("a")?;
    let needle = format!("{year}年度");

    for anchor in document.select(&anchors) {
        let text: String = anchor.text().collect();
        if text.contains(&needle) {
            if let Some(href) = anchor.value().attr("href") {
                return resolve_url(base_url, href);
            }
        }
    }
    Err(EtlError::Parse(format!(
        "no listing page link for fiscal year {year} on the index page"
    )))
}

pub(crate) fn resolve_url(base: &str, href: &str) -> Result<String> {
    let base = reqwest::Url::parse(base)
        .map_err(|e| EtlError::Parse(format!("invalid base URL '{base}': {e}")))?;
    let resolved = base
        .join(href)
        .map_err(|e| EtlError::Parse(format!("invalid link '{href}': {e}")))?;
    Ok(resolved.to_string())
}

fn header_target(header: &str) -> Option<&'static str> {
    const MAP: [(&str, &str); 7] = [
        ("承認番号", "approval_id"),
        ("申請区分", "application_type"),
        ("販売名", "brand_name_jp"),
        ("一般的名称", "generic_name_jp"),
        ("申請者", "applicant_name_jp"),
        ("承認日", "approval_date"),
        ("効能", "indication"),
    ];
    let header = header.trim();
    MAP.iter()
        .find(|(jp, _)| header.contains(jp))
        .map(|(_, target)| *target)
}

fn cell_text(cell: ElementRef<'_>) -> Value {
    let text: String = cell.text().collect::<String>().trim().to_string();
    if text.is_empty() {
        Value::Null
    } else {
        json!(text)
    }
}

/// Parse the approvals table on a year listing page into target columns.
fn parse_listing_table(html: &str, base_url: &str) -> Result<DataBatch> {
    let document = Html::parse_document(html);
    let tables = selector("table")?;
    let rows = selector("tr")?;
    let header_cells = selector("th, td")?;
    let data_cells = selector("td")?;
    let links = selector("a")?;

    for table in document.select(&tables) {
        let mut table_rows = table.select(&rows);
        let Some(header_row) = table_rows.next() else {
            continue;
        };
        let targets: Vec<Option<&'static str>> = header_row
            .select(&header_cells)
            .map(|cell| header_target(&cell.text().collect::<String>()))
            .collect();
        // The approvals table is the one with an approval-number column
        if !targets.contains(&Some("approval_id")) {
            continue;
        }

        let mut batch = DataBatch::new(COLUMNS);
        for row in table_rows {
            let cells: Vec<ElementRef<'_>> = row.select(&data_cells).collect();
            if cells.is_empty() {
                continue;
            }
            let mut values = vec![Value::Null; COLUMNS.len()];
            for (cell, target) in cells.iter().zip(&targets) {
                if let Some(target) = target {
                    let idx = COLUMNS
                        .iter()
                        .position(|c| c == target)
                        .ok_or_else(|| EtlError::Parse(format!("unknown column {target}")))?;
                    values[idx] = cell_text(*cell);
                }
            }
            if let Some(href) = row
                .select(&links)
                .find_map(|a| a.value().attr("href"))
            {
                values[COLUMNS.len() - 1] = json!(resolve_url(base_url, href)?);
            }
            batch.push_row(values)?;
        }
        return Ok(batch);
    }

    Err(EtlError::Parse(
        "no approvals table found on the listing page".to_string(),
    ))
}
