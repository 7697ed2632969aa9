//! Client-side grouped aggregation over raw records.
//!
//! Produces the same [`GroupedResult`] shape as the aggregation endpoint so
//! the orchestrator can fall back transparently.

use futures::{Stream, TryStreamExt};
use serde_json::Value;
use std::collections::HashMap;
use tabula_core::result::value_label;
use tabula_core::{
    AggOp, FieldName, GroupedResult, GroupedRow, Metric, Record, Result, ResultSource,
};

/// Reads a metric cell as a number. Numeric strings (including thousands
/// separators) are parsed; null, booleans and other text are not numbers.
pub fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
struct Accumulator {
    sum: f64,
    rows: u64,
    numeric: u64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Accumulator {
    fn add(&mut self, value: Option<f64>) {
        self.rows += 1;
        if let Some(v) = value {
            self.sum += v;
            self.numeric += 1;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn value(&self, op: AggOp) -> f64 {
        match op {
            AggOp::Sum => self.sum,
            AggOp::Count => self.rows as f64,
            AggOp::Avg if self.numeric > 0 => self.sum / self.numeric as f64,
            AggOp::Avg => 0.0,
            AggOp::Min => self.min.unwrap_or(0.0),
            AggOp::Max => self.max.unwrap_or(0.0),
        }
    }
}

struct Group {
    key: Vec<Value>,
    accumulators: Vec<Accumulator>,
}

/// Streaming reducer. Memory grows with the number of distinct groups, not
/// with the number of records.
pub struct ClientAggregator {
    dimensions: Vec<FieldName>,
    metrics: Vec<Metric>,
    index: HashMap<Vec<String>, usize>,
    groups: Vec<Group>,
    nulls_coerced: u64,
    records_scanned: u64,
}

impl ClientAggregator {
    pub fn new(dimensions: Vec<FieldName>, metrics: Vec<Metric>) -> Self {
        Self {
            dimensions,
            metrics,
            index: HashMap::new(),
            groups: Vec::new(),
            nulls_coerced: 0,
            records_scanned: 0,
        }
    }

    pub fn push(&mut self, record: &Record) {
        self.records_scanned += 1;

        let key: Vec<Value> = self
            .dimensions
            .iter()
            .map(|d| record.get(d).cloned().unwrap_or(Value::Null))
            .collect();
        let labels: Vec<String> = key.iter().map(value_label).collect();

        let position = match self.index.get(&labels) {
            Some(position) => *position,
            None => {
                self.groups.push(Group {
                    key,
                    accumulators: vec![Accumulator::default(); self.metrics.len()],
                });
                self.index.insert(labels, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };

        let group = &mut self.groups[position];
        for (metric, accumulator) in self.metrics.iter().zip(group.accumulators.iter_mut()) {
            let value = record.get(&metric.field).and_then(numeric_value);
            if value.is_none() {
                self.nulls_coerced += 1;
            }
            accumulator.add(value);
        }
    }

    pub fn finish(self) -> GroupedResult {
        let metrics = self.metrics;
        let rows = self
            .groups
            .into_iter()
            .map(|group| GroupedRow {
                key: group.key,
                values: metrics
                    .iter()
                    .zip(&group.accumulators)
                    .map(|(metric, acc)| acc.value(metric.op))
                    .collect(),
            })
            .collect();

        let mut result = GroupedResult::empty(self.dimensions, metrics, ResultSource::ClientSide);
        result.rows = rows;
        result.metadata.nulls_coerced = self.nulls_coerced;
        result.metadata.records_scanned = Some(self.records_scanned);
        result
    }
}

/// Reduces an in-memory set of records.
pub fn aggregate<'a, I>(records: I, group_by: &[FieldName], metrics: &[Metric]) -> GroupedResult
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut aggregator = ClientAggregator::new(group_by.to_vec(), metrics.to_vec());
    for record in records {
        aggregator.push(record);
    }
    aggregator.finish()
}

/// Reduces a record stream without buffering it.
pub async fn aggregate_stream<S>(
    records: S,
    group_by: &[FieldName],
    metrics: &[Metric],
) -> Result<GroupedResult>
where
    S: Stream<Item = Result<Record>>,
{
    let aggregator = ClientAggregator::new(group_by.to_vec(), metrics.to_vec());
    let aggregator = records
        .try_fold(aggregator, |mut aggregator, record| async move {
            aggregator.push(&record);
            Ok(aggregator)
        })
        .await?;
    Ok(aggregator.finish())
}
