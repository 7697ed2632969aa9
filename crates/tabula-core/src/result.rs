//! Normalized grouped result shared by both aggregation paths.
//!
//! The server-side aggregation client and the client-side aggregator both
//! produce a [`GroupedResult`], so the orchestrator can substitute one for the
//! other without the caller noticing anything but `metadata.source`.

use crate::query::{FieldName, Metric, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Which backend path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Server-side aggregation endpoint.
    Aggregation,
    /// Pagination plus client-side reduction.
    ClientSide,
}

/// Provenance and data-quality information attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub source: ResultSource,
    /// Metric values that were missing, null or non-numeric.
    #[serde(default)]
    pub nulls_coerced: u64,
    /// Raw rows reduced on the client side (None for server-side results).
    #[serde(default)]
    pub records_scanned: Option<u64>,
    /// Caller field name to the field actually queried.
    #[serde(default)]
    pub substitutions: BTreeMap<FieldName, FieldName>,
    /// Recovered failures the caller should know about.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ResultMetadata {
    pub fn new(source: ResultSource) -> Self {
        Self {
            source,
            nulls_coerced: 0,
            records_scanned: None,
            substitutions: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }
}

/// One group: its dimension values and one value per metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedRow {
    /// Dimension values, aligned with `GroupedResult::dimensions`.
    pub key: Vec<Value>,
    /// Metric values, aligned with `GroupedResult::metrics`.
    pub values: Vec<f64>,
}

impl GroupedRow {
    /// Text form of the key, used for lookups and comparisons.
    pub fn key_labels(&self) -> Vec<String> {
        self.key.iter().map(value_label).collect()
    }
}

/// Grouped-aggregation output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedResult {
    pub dimensions: Vec<FieldName>,
    pub metrics: Vec<Metric>,
    pub rows: Vec<GroupedRow>,
    /// Totals and metadata rows the backend appended after the groups.
    #[serde(default)]
    pub summary: Vec<Record>,
    pub metadata: ResultMetadata,
}

impl GroupedResult {
    pub fn empty(dimensions: Vec<FieldName>, metrics: Vec<Metric>, source: ResultSource) -> Self {
        Self {
            dimensions,
            metrics,
            rows: Vec::new(),
            summary: Vec::new(),
            metadata: ResultMetadata::new(source),
        }
    }

    /// Finds the group whose key labels equal `key`.
    pub fn find(&self, key: &[&str]) -> Option<&GroupedRow> {
        self.rows.iter().find(|row| {
            row.key.len() == key.len()
                && row
                    .key
                    .iter()
                    .zip(key)
                    .all(|(value, wanted)| value_label(value) == *wanted)
        })
    }

    /// Value of metric `metric_index` for the group `key`.
    pub fn value(&self, key: &[&str], metric_index: usize) -> Option<f64> {
        self.find(key)
            .and_then(|row| row.values.get(metric_index).copied())
    }

    /// Per-metric sum over all groups.
    pub fn totals(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.metrics.len()];
        for row in &self.rows {
            for (total, value) in totals.iter_mut().zip(&row.values) {
                *total += value;
            }
        }
        totals
    }

    /// Group labels to the value of one metric.
    pub fn to_map(&self, metric_index: usize) -> BTreeMap<Vec<String>, f64> {
        self.rows
            .iter()
            .filter_map(|row| {
                row.values
                    .get(metric_index)
                    .map(|value| (row.key_labels(), *value))
            })
            .collect()
    }

    /// Orders groups by their key labels.
    pub fn sort_rows(&mut self) {
        self.rows.sort_by_key(|row| row.key_labels());
    }

    /// Renames dimension and metric fields (queried name to caller name).
    ///
    /// Summary rows are renamed too, so nothing in the result still refers to
    /// a substituted field.
    pub fn relabel(&mut self, renames: &BTreeMap<FieldName, FieldName>) {
        if renames.is_empty() {
            return;
        }
        for dimension in &mut self.dimensions {
            if let Some(renamed) = renames.get(dimension) {
                *dimension = renamed.clone();
            }
        }
        for metric in &mut self.metrics {
            if let Some(renamed) = renames.get(&metric.field) {
                metric.field = renamed.clone();
            }
        }
        for record in &mut self.summary {
            let renamed: Record = std::mem::take(record)
                .into_iter()
                .map(|(key, value)| match renames.get(&key) {
                    Some(new_key) => (new_key.clone(), value),
                    None => (key, value),
                })
                .collect();
            *record = renamed;
        }
    }

    /// Compares two results group by group with a relative tolerance.
    ///
    /// Row order and metadata are ignored.
    pub fn approx_eq(&self, other: &GroupedResult, tolerance: f64) -> bool {
        if self.dimensions != other.dimensions || self.metrics != other.metrics {
            return false;
        }
        if self.rows.len() != other.rows.len() {
            return false;
        }
        let theirs: BTreeMap<Vec<String>, &Vec<f64>> = other
            .rows
            .iter()
            .map(|row| (row.key_labels(), &row.values))
            .collect();

        self.rows.iter().all(|row| match theirs.get(&row.key_labels()) {
            Some(values) => {
                values.len() == row.values.len()
                    && row
                        .values
                        .iter()
                        .zip(values.iter())
                        .all(|(a, b)| nearly_equal(*a, *b, tolerance))
            }
            None => false,
        })
    }
}

/// Text form of a dimension value: strings verbatim, null as empty.
pub fn value_label(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn nearly_equal(a: f64, b: f64, tolerance: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= tolerance * scale
}
