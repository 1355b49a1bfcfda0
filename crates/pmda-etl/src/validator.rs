//! Declarative data-quality checks applied between transform and load.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{error, info};

use crate::batch::DataBatch;

/// One validation rule from the dataset configuration.
///
/// The check name stays a string on purpose: an unknown check is a recorded
/// validation error at run time, not a config-parse failure.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub column: String,
    pub check: String,
    #[serde(flatten, default)]
    pub params: BTreeMap<String, Value>,
}

/// Rule engine. `validate` returns false and accumulates human-readable
/// error strings; it never panics on malformed rules or data.
#[derive(Debug, Default)]
pub struct DataValidator {
    rules: Vec<Rule>,
    pub errors: Vec<String>,
}

impl DataValidator {
    pub fn new(rules: Vec<Rule>) -> Self {
        DataValidator {
            rules,
            errors: Vec::new(),
        }
    }

    /// Run every rule against the batch. A batch with no configured rules
    /// always validates successfully.
    pub fn validate(&mut self, batch: &DataBatch) -> bool {
        self.errors.clear();
        if self.rules.is_empty() {
            info!("No validation rules configured, skipping validation");
            return true;
        }

        let rules = self.rules.clone();
        for rule in &rules {
            if batch.column_index(&rule.column).is_none() {
                self.errors.push(format!(
                    "Validation failed: Column '{}' not found in dataset.",
                    rule.column
                ));
                continue;
            }

            match rule.check.as_str() {
                "not_null" => self.check_not_null(batch, rule),
                "is_unique" => self.check_is_unique(batch, rule),
                "has_type" => self.check_has_type(batch, rule),
                "is_in_range" => self.check_is_in_range(batch, rule),
                "is_in_set" => self.check_is_in_set(batch, rule),
                other => self.errors.push(format!("Unknown validation check: {other}")),
            }
        }

        if self.errors.is_empty() {
            info!("Data validation successful");
            true
        } else {
            for err in &self.errors {
                error!("Data validation failure: {err}");
            }
            false
        }
    }

    fn values<'a>(&self, batch: &'a DataBatch, column: &str) -> Vec<&'a Value> {
        batch.column_values(column).unwrap_or_default()
    }

    fn check_not_null(&mut self, batch: &DataBatch, rule: &Rule) {
        let null_count = self
            .values(batch, &rule.column)
            .iter()
            .filter(|v| v.is_null())
            .count();
        if null_count > 0 {
            self.errors.push(format!(
                "Column '{}' has {null_count} null values.",
                rule.column
            ));
        }
    }

    fn check_is_unique(&mut self, batch: &DataBatch, rule: &Rule) {
        let mut seen = HashSet::new();
        let mut duplicates = HashSet::new();
        for value in self.values(batch, &rule.column) {
            let key = value.to_string();
            if !seen.insert(key.clone()) {
                duplicates.insert(key);
            }
        }
        if !duplicates.is_empty() {
            self.errors.push(format!(
                "Column '{}' is not unique. Found {} duplicate values.",
                rule.column,
                duplicates.len()
            ));
        }
    }

    fn check_has_type(&mut self, batch: &DataBatch, rule: &Rule) {
        let Some(expected) = rule.params.get("type").and_then(Value::as_str) else {
            self.errors.push(format!(
                "Check 'has_type' on column '{}' is missing the 'type' parameter.",
                rule.column
            ));
            return;
        };

        let bad = self
            .values(batch, &rule.column)
            .iter()
            .filter(|v| !v.is_null() && !value_has_type(v, expected))
            .count();
        if bad > 0 {
            self.errors.push(format!(
                "Column '{}' contains {bad} non-{expected} values.",
                rule.column
            ));
        }
    }

    fn check_is_in_range(&mut self, batch: &DataBatch, rule: &Rule) {
        let (Some(min), Some(max)) = (
            rule.params.get("min").and_then(Value::as_f64),
            rule.params.get("max").and_then(Value::as_f64),
        ) else {
            self.errors.push(format!(
                "Check 'is_in_range' on column '{}' requires numeric 'min' and 'max'.",
                rule.column
            ));
            return;
        };

        let out_of_range = self
            .values(batch, &rule.column)
            .iter()
            .filter(|v| !v.is_null())
            .filter(|v| match as_number(v) {
                Some(n) => n < min || n > max,
                None => true,
            })
            .count();
        if out_of_range > 0 {
            self.errors.push(format!(
                "Column '{}' has {out_of_range} values outside the range [{min}, {max}].",
                rule.column
            ));
        }
    }

    fn check_is_in_set(&mut self, batch: &DataBatch, rule: &Rule) {
        let Some(allowed) = rule.params.get("values").and_then(Value::as_array) else {
            self.errors.push(format!(
                "Check 'is_in_set' on column '{}' requires a 'values' list.",
                rule.column
            ));
            return;
        };

        let invalid: HashSet<String> = self
            .values(batch, &rule.column)
            .iter()
            .filter(|v| !v.is_null() && !allowed.contains(v))
            .map(|v| v.to_string())
            .collect();
        if !invalid.is_empty() {
            let mut listed: Vec<String> = invalid.into_iter().collect();
            listed.sort();
            self.errors.push(format!(
                "Column '{}' contains values not in the allowed set: [{}]",
                rule.column,
                listed.join(", ")
            ));
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_has_type(value: &Value, expected: &str) -> bool {
    match expected {
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64(),
            Value::String(s) => s.trim().parse::<i64>().is_ok(),
            _ => false,
        },
        "float" => as_number(value).is_some(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "date" => value
            .as_str()
            .is_some_and(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
        "datetime" => value.as_str().is_some_and(|s| {
            chrono::DateTime::parse_from_rfc3339(s).is_ok()
                || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
        }),
        _ => false,
    }
}
