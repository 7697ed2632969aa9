//! Query model: what a caller asks for and the raw rows that come back.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a column in a finance table.
pub type FieldName = String;

/// One raw business row: field name to JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Aggregation operator applied to a metric field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggOp {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl AggOp {
    /// Wire name used by the aggregation endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggOp::Sum => "SUM",
            AggOp::Count => "COUNT",
            AggOp::Avg => "AVG",
            AggOp::Min => "MIN",
            AggOp::Max => "MAX",
        }
    }
}

impl fmt::Display for AggOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field plus the operator computed per group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metric {
    pub field: FieldName,
    #[serde(rename = "agg")]
    pub op: AggOp,
}

impl Metric {
    pub fn new(field: impl Into<FieldName>, op: AggOp) -> Self {
        Self {
            field: field.into(),
            op,
        }
    }

    pub fn sum(field: impl Into<FieldName>) -> Self {
        Self::new(field, AggOp::Sum)
    }

    pub fn count(field: impl Into<FieldName>) -> Self {
        Self::new(field, AggOp::Count)
    }

    /// Column names the backend may use for this metric in a grouped row,
    /// most specific first.
    pub fn column_candidates(&self) -> [String; 3] {
        [
            format!("{}({})", self.op.as_str(), self.field),
            format!("{}_{}", self.field, self.op.as_str().to_lowercase()),
            self.field.clone(),
        ]
    }
}

/// Restricts rows to (or excludes rows with) a set of field values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub name: FieldName,
    pub values: Vec<String>,
    #[serde(default)]
    pub is_excluded: bool,
}

impl Filter {
    /// Keeps rows whose field is one of `values`.
    pub fn include<I, S>(name: impl Into<FieldName>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
            is_excluded: false,
        }
    }

    /// Drops rows whose field is one of `values`.
    pub fn exclude<I, S>(name: impl Into<FieldName>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            is_excluded: true,
            ..Self::include(name, values)
        }
    }
}

/// Canonical text form of a filter set, independent of filter and value order.
///
/// Two filter lists that select the same rows produce the same fingerprint,
/// which makes it usable as part of a cache key. Values are JSON-encoded, so
/// delimiter characters inside a value cannot merge two distinct filters.
pub fn filter_fingerprint(filters: &[Filter]) -> String {
    let mut canonical: Vec<(&str, bool, Vec<&str>)> = filters
        .iter()
        .map(|filter| {
            let mut values: Vec<&str> = filter.values.iter().map(String::as_str).collect();
            values.sort_unstable();
            values.dedup();
            (filter.name.as_str(), filter.is_excluded, values)
        })
        .collect();
    canonical.sort();
    canonical.dedup();

    let entries = canonical
        .into_iter()
        .map(|(name, is_excluded, values)| {
            serde_json::json!({"name": name, "excluded": is_excluded, "values": values})
        })
        .collect();
    serde_json::Value::Array(entries).to_string()
}

/// A caller's grouped-aggregation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub table: String,
    pub dimensions: Vec<FieldName>,
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            dimensions: Vec::new(),
            metrics: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn group_by(mut self, dimension: impl Into<FieldName>) -> Self {
        self.dimensions.push(dimension.into());
        self
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Every dimension and metric field, in query order, without duplicates.
    pub fn referenced_fields(&self) -> Vec<FieldName> {
        let mut fields: Vec<FieldName> = Vec::new();
        for field in self
            .dimensions
            .iter()
            .chain(self.metrics.iter().map(|m| &m.field))
        {
            if !fields.contains(field) {
                fields.push(field.clone());
            }
        }
        fields
    }

    /// Returns a copy with every dimension and metric field passed through `map`.
    pub fn map_fields<F>(&self, mut map: F) -> QuerySpec
    where
        F: FnMut(&str) -> FieldName,
    {
        QuerySpec {
            table: self.table.clone(),
            dimensions: self.dimensions.iter().map(|d| map(d)).collect(),
            metrics: self
                .metrics
                .iter()
                .map(|m| Metric::new(map(&m.field), m.op))
                .collect(),
            filters: self.filters.clone(),
        }
    }
}

/// Whether a page was full or terminated the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageStatus {
    /// As many rows as requested came back; more may follow.
    Full,
    /// Fewer rows than requested: end of the row set.
    Short,
}

/// One batch of raw rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub offset: u64,
    pub requested: u64,
    pub records: Vec<Record>,
    pub status: PageStatus,
}

impl Page {
    pub fn new(offset: u64, requested: u64, records: Vec<Record>) -> Self {
        let status = if (records.len() as u64) < requested {
            PageStatus::Short
        } else {
            PageStatus::Full
        };
        Self {
            offset,
            requested,
            records,
            status,
        }
    }

    /// Offset of the first row after this page.
    pub fn next_offset(&self) -> u64 {
        self.offset + self.records.len() as u64
    }

    pub fn is_last(&self) -> bool {
        self.status == PageStatus::Short
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_serializes_with_agg_key() {
        let json = serde_json::to_value(Metric::sum("Amount")).unwrap();
        assert_eq!(json, serde_json::json!({"field": "Amount", "agg": "SUM"}));
    }

    #[test]
    fn test_fingerprint_ignores_order() {
        let a = vec![
            Filter::include("Scenario", ["Actuals", "Budget"]),
            Filter::include("System_Year", ["2025"]),
        ];
        let b = vec![
            Filter::include("System_Year", ["2025"]),
            Filter::include("Scenario", ["Budget", "Actuals"]),
        ];
        assert_eq!(filter_fingerprint(&a), filter_fingerprint(&b));

        let excluded = vec![
            Filter::include("System_Year", ["2025"]),
            Filter::exclude("Scenario", ["Budget", "Actuals"]),
        ];
        assert_ne!(filter_fingerprint(&a), filter_fingerprint(&excluded));
    }

    #[test]
    fn test_fingerprint_keeps_delimiters_inside_values() {
        let joined = vec![Filter::include("Scenario", ["Actuals|Budget"])];
        let split = vec![Filter::include("Scenario", ["Actuals", "Budget"])];
        assert_ne!(filter_fingerprint(&joined), filter_fingerprint(&split));

        let bracketed = vec![Filter::include("Scenario", ["a];Year=[2025"])];
        let two_filters = vec![
            Filter::include("Scenario", ["a"]),
            Filter::include("Year", ["2025"]),
        ];
        assert_ne!(filter_fingerprint(&bracketed), filter_fingerprint(&two_filters));
    }

    #[test]
    fn test_fingerprint_dedups_repeated_filters() {
        let once = vec![Filter::include("Scenario", ["Actuals"])];
        let twice = vec![
            Filter::include("Scenario", ["Actuals"]),
            Filter::include("Scenario", ["Actuals", "Actuals"]),
        ];
        assert_eq!(filter_fingerprint(&once), filter_fingerprint(&twice));
    }

    #[test]
    fn test_referenced_fields_dedup() {
        let spec = QuerySpec::new("16528")
            .group_by("Scenario")
            .metric(Metric::sum("Amount"))
            .metric(Metric::count("Amount"));
        assert_eq!(spec.referenced_fields(), vec!["Scenario", "Amount"]);
    }

    #[test]
    fn test_page_status() {
        let page = Page::new(1000, 500, vec![Record::new(); 12]);
        assert!(page.is_last());
        assert_eq!(page.next_offset(), 1012);

        let page = Page::new(0, 2, vec![Record::new(); 2]);
        assert_eq!(page.status, PageStatus::Full);
    }
}
