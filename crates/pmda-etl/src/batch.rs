//! In-memory tabular datasets moving through the pipeline.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::error::{EtlError, Result};

/// Named batches keyed by target table name.
pub type NamedBatches = BTreeMap<String, DataBatch>;

/// Output of a parser or transformer: either one table or a map of tables.
#[derive(Debug, Clone)]
pub enum TableSet {
    Single(DataBatch),
    Named(NamedBatches),
}

/// A small column-named row store. Cells are JSON values so that one shape
/// serves CSV input, JSON audit payloads, and all three backend encoders.
#[derive(Debug, Clone, Default)]
pub struct DataBatch {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl DataBatch {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DataBatch {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(EtlError::Parse(format!(
                "row has {} cells but batch has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append another batch's rows; the column layouts must match.
    pub fn extend_from(&mut self, other: DataBatch) -> Result<()> {
        if other.columns != self.columns {
            return Err(EtlError::Parse(format!(
                "cannot combine batches with columns {:?} and {:?}",
                self.columns, other.columns
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Rename a column in place; unknown names are left untouched.
    pub fn rename_column(&mut self, from: &str, to: &str) {
        if let Some(idx) = self.column_index(from) {
            self.columns[idx] = to.to_string();
        }
    }

    /// Keep only rows matching the predicate.
    pub fn retain_rows<F>(&mut self, f: F)
    where
        F: Fn(&[Value]) -> bool,
    {
        self.rows.retain(|row| f(row));
    }

    /// Apply a cell-wise conversion to one column.
    pub fn map_column<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Value) -> Value,
    {
        if let Some(idx) = self.column_index(name) {
            for row in &mut self.rows {
                row[idx] = f(&row[idx]);
            }
        }
    }

    /// Append the audit payload and immutable provenance columns to every row.
    ///
    /// `raw_data_full` holds the original row serialized as a JSON object of
    /// the pre-provenance columns; the `_meta_*` columns carry load metadata.
    pub fn attach_provenance(&mut self, provenance: &Provenance) {
        let original_columns = self.columns.clone();

        for row in &mut self.rows {
            let raw: serde_json::Map<String, Value> = original_columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect();
            row.push(Value::Object(raw));
            // Naive UTC wall time; all three backends ingest this form
            row.push(json!(provenance
                .load_ts
                .naive_utc()
                .format("%Y-%m-%d %H:%M:%S%.6f")
                .to_string()));
            row.push(json!(provenance.content_hash));
            row.push(json!(provenance.source_url));
            row.push(json!(provenance.pipeline_version));
        }

        self.columns.extend(
            [
                "raw_data_full",
                "_meta_load_ts_utc",
                "_meta_source_content_hash",
                "_meta_source_url",
                "_meta_pipeline_version",
            ]
            .map(String::from),
        );
    }
}

/// Load metadata stamped onto every transformed row.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub load_ts: DateTime<Utc>,
    pub source_url: String,
    pub content_hash: String,
    pub pipeline_version: String,
}

impl Provenance {
    pub fn new(source_url: &str, content_hash: &str) -> Self {
        Provenance {
            load_ts: Utc::now(),
            source_url: source_url.to_string(),
            content_hash: content_hash.to_string(),
            pipeline_version: crate::state::PIPELINE_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> DataBatch {
        let mut batch = DataBatch::new(["id", "name"]);
        batch.push_row(vec![json!(1), json!("a")]).unwrap();
        batch.push_row(vec![json!(2), json!("b")]).unwrap();
        batch
    }

    #[test]
    fn test_push_row_length_mismatch() {
        let mut batch = DataBatch::new(["id"]);
        assert!(batch.push_row(vec![json!(1), json!(2)]).is_err());
    }

    #[test]
    fn test_extend_from_requires_matching_columns() {
        let mut batch = sample_batch();
        let mut more = DataBatch::new(["id", "name"]);
        more.push_row(vec![json!(3), json!("c")]).unwrap();
        batch.extend_from(more).unwrap();
        assert_eq!(batch.len(), 3);

        let other_shape = DataBatch::new(["id"]);
        assert!(batch.extend_from(other_shape).is_err());
    }

    #[test]
    fn test_column_values() {
        let batch = sample_batch();
        let names = batch.column_values("name").unwrap();
        assert_eq!(names, vec![&json!("a"), &json!("b")]);
        assert!(batch.column_values("missing").is_none());
    }

    #[test]
    fn test_attach_provenance() {
        let mut batch = sample_batch();
        let provenance = Provenance::new("http://example/f.csv", "abc123");
        batch.attach_provenance(&provenance);

        assert_eq!(batch.columns().len(), 7);
        assert_eq!(batch.columns()[2], "raw_data_full");
        let row = &batch.rows()[0];
        assert_eq!(row[2], json!({"id": 1, "name": "a"}));
        assert_eq!(row[4], json!("abc123"));
        assert_eq!(row[5], json!("http://example/f.csv"));
    }
}
