//! Typed dataset registry and the collaborator seams the orchestrator uses.
//!
//! Each dataset kind resolves once from configuration to a pipeline that
//! knows how to discover and fetch its artifacts and how to turn them into
//! load-ready batches. The orchestrator only ever sees this trait.

use async_trait::async_trait;
use serde::Deserialize;

use crate::batch::NamedBatches;
use crate::config::DatasetConfig;
use crate::error::Result;
use crate::fetch::{FetchClient, FetchResult};
use crate::schema::SchemaDef;
use crate::state::Watermark;

pub mod approvals;
pub mod jader;

/// The datasets this engine knows how to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// New drug approvals, scraped from yearly HTML listing pages.
    Approvals,
    /// JADER adverse-event case reports, a ZIP archive of CSV tables.
    Jader,
}

/// Dataset-specific flags forwarded from the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub year: Option<i32>,
    pub drug_names: Vec<String>,
}

/// Extraction output: fetched artifacts plus the new watermark for the
/// orchestrator's delta check.
#[derive(Debug)]
pub struct Extraction {
    pub artifacts: Vec<FetchResult>,
    pub watermark: Watermark,
}

/// One dataset pipeline: extract artifacts, then parse and transform them
/// into named batches with provenance attached.
#[async_trait]
pub trait DatasetPipeline: Send + Sync {
    /// Tables this dataset loads, used for schema-ensure every run.
    fn target_schema(&self, config: &DatasetConfig) -> SchemaDef;

    async fn extract(
        &self,
        client: &FetchClient,
        config: &DatasetConfig,
        last_watermark: &Watermark,
        args: &RunArgs,
    ) -> Result<Extraction>;

    fn transform(
        &self,
        config: &DatasetConfig,
        extraction: &Extraction,
        args: &RunArgs,
    ) -> Result<NamedBatches>;
}

pub fn pipeline_for(kind: DatasetKind) -> Box<dyn DatasetPipeline> {
    match kind {
        DatasetKind::Approvals => Box::new(approvals::ApprovalsPipeline),
        DatasetKind::Jader => Box::new(jader::JaderPipeline),
    }
}
