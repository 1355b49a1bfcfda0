//! Run-state types: watermark, status, and the `ingestion_state` row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Provenance tag written with every load and every state row.
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Opaque change-detection value for a dataset's upstream source.
///
/// Typically `{"etag": …, "last_modified": …}` for a single artifact or
/// `{"files": {url: {…}}}` for multi-file datasets. The orchestrator only
/// compares watermarks for equality as a whole; their structure belongs to
/// the extractor that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Watermark(Value);

impl Watermark {
    /// The empty watermark, used when a dataset has never run.
    pub fn empty() -> Self {
        Watermark(Value::Null)
    }

    pub fn from_value(value: Value) -> Self {
        Watermark(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// True when no prior state exists (null or an empty object).
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Build a watermark from HTTP validators, falling back to a content
    /// hash when the server sent neither `ETag` nor `Last-Modified`.
    pub fn from_validators(
        etag: Option<&str>,
        last_modified: Option<&str>,
        content_hash: &str,
    ) -> Self {
        let mut map = serde_json::Map::new();
        if let Some(etag) = etag {
            map.insert("etag".to_string(), json!(etag));
        }
        if let Some(last_modified) = last_modified {
            map.insert("last_modified".to_string(), json!(last_modified));
        }
        if map.is_empty() {
            map.insert("content_hash".to_string(), json!(content_hash));
        }
        Watermark(Value::Object(map))
    }

    /// ETag stored in this watermark, if any.
    pub fn etag(&self) -> Option<&str> {
        self.0.get("etag").and_then(Value::as_str)
    }

    /// Last-Modified value stored in this watermark, if any.
    pub fn last_modified(&self) -> Option<&str> {
        self.0.get("last_modified").and_then(Value::as_str)
    }

    /// Sub-watermark for one URL of a multi-file watermark
    /// (`{"files": {url: {…}}}`); empty when the URL is unknown.
    pub fn for_url(&self, url: &str) -> Watermark {
        self.0
            .get("files")
            .and_then(|files| files.get(url))
            .map(|v| Watermark(v.clone()))
            .unwrap_or_else(Watermark::empty)
    }

    /// Assemble a multi-file watermark from per-URL watermarks.
    pub fn from_files<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Watermark)>,
    {
        let files: serde_json::Map<String, Value> = entries
            .into_iter()
            .map(|(url, wm)| (url, wm.into_value()))
            .collect();
        Watermark(json!({ "files": files }))
    }
}

/// Terminal status of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "SUCCESS"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

/// One row of the `ingestion_state` table (at most one per dataset).
#[derive(Debug, Clone, Serialize)]
pub struct IngestionState {
    pub dataset_id: String,
    pub last_run_ts_utc: DateTime<Utc>,
    /// Updated only on success; a failed run preserves the prior value.
    pub last_successful_run_ts_utc: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub last_watermark: Watermark,
    pub pipeline_version: String,
}
