//! Server-side aggregation: submit, poll, normalize.
//!
//! # State machine
//!
//! ```text
//! Submitted ──ready──────────────▶ Succeeded
//!     │ ──rejected────────────────▶ Failed
//!     ▼ accepted
//! Polling ──ready─────────────────▶ Succeeded
//!     │ ──failed──────────────────▶ Failed
//!     │ ──max_polls reached───────▶ TimedOut
//!     └─processing (sleep, poll)──┘
//! ```

use crate::call::authorized;
use crate::client_aggregator::numeric_value;
use crate::token_manager::TokenManager;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tabula_core::{
    AggregateSubmission, FieldName, GroupedResult, GroupedRow, Metric, PollResponse, QuerySpec,
    Record, Result, ResultSource, TableApi, TabulaError,
};

const MARKER_KEYS: &[&str] = &["_is_total", "is_total", "__total__"];
const ROW_TYPE_KEYS: &[&str] = &["row_type", "_row_type"];
const SUMMARY_ROW_TYPES: &[&str] = &["total", "subtotal", "summary", "grand_total", "metadata"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::TimedOut)
    }
}

/// One aggregation job and everything known about its progress.
#[derive(Debug, Clone)]
pub struct AggregationTask {
    pub id: String,
    pub query: QuerySpec,
    /// Poll location once the backend accepted the job asynchronously.
    pub handle: Option<String>,
    pub state: TaskState,
    pub poll_attempts: u32,
    result: Option<GroupedResult>,
    error: Option<TabulaError>,
}

impl AggregationTask {
    fn new(query: QuerySpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query,
            handle: None,
            state: TaskState::Submitted,
            poll_attempts: 0,
            result: None,
            error: None,
        }
    }

    fn succeed(&mut self, rows: Vec<Record>) {
        self.result = Some(grouped_from_rows(&self.query, rows));
        self.state = TaskState::Succeeded;
    }

    fn fail(&mut self, message: String, field: Option<String>) {
        self.error = Some(TabulaError::field_unsupported(field, message));
        self.state = TaskState::Failed;
    }

    pub fn result(&self) -> Option<&GroupedResult> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&TabulaError> {
        self.error.as_ref()
    }
}

/// Talks to the aggregation endpoint for one environment.
///
/// Field substitution is not its concern: a rejected field surfaces as
/// [`TabulaError::FieldUnsupported`] and the orchestrator decides what next.
#[derive(Clone)]
pub struct AggregationClient {
    api: Arc<dyn TableApi>,
    tokens: Arc<TokenManager>,
    environment: String,
    request_timeout: Duration,
}

impl AggregationClient {
    pub fn new(
        api: Arc<dyn TableApi>,
        tokens: Arc<TokenManager>,
        environment: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            api,
            tokens,
            environment: environment.into(),
            request_timeout,
        }
    }

    /// Posts `query` and returns the task in its post-submit state.
    pub async fn submit(&self, query: QuerySpec) -> Result<AggregationTask> {
        let mut task = AggregationTask::new(query);
        let api = &self.api;
        let query = &task.query;

        let submission = authorized(&self.tokens, &self.environment, self.request_timeout, |credential| {
            async move { api.submit_aggregate(&credential, query).await }
        })
        .await?;

        match submission {
            AggregateSubmission::Ready(rows) => {
                tracing::debug!(
                    target: "tabula::aggregation",
                    task_id = %task.id,
                    rows = rows.len(),
                    "[AggregationClient] Synchronous result"
                );
                task.succeed(rows);
            }
            AggregateSubmission::Accepted { handle } => {
                tracing::debug!(
                    target: "tabula::aggregation",
                    task_id = %task.id,
                    %handle,
                    "[AggregationClient] Accepted, polling"
                );
                task.handle = Some(handle);
                task.state = TaskState::Polling;
            }
            AggregateSubmission::Rejected { message, field } => {
                tracing::info!(
                    target: "tabula::aggregation",
                    task_id = %task.id,
                    field = field.as_deref().unwrap_or("<unnamed>"),
                    "[AggregationClient] Query rejected: {}",
                    message
                );
                task.fail(message, field);
            }
        }
        Ok(task)
    }

    /// Drives `task` to a terminal state.
    ///
    /// Polling sleeps `poll_interval` before each check and gives up after
    /// `max_polls` checks with [`TabulaError::PollTimeout`].
    pub async fn await_result(
        &self,
        mut task: AggregationTask,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Result<GroupedResult> {
        while !task.state.is_terminal() {
            if task.poll_attempts >= max_polls {
                task.state = TaskState::TimedOut;
                break;
            }
            let Some(handle) = task.handle.clone() else {
                return Err(TabulaError::internal(format!(
                    "aggregation task {} is pending without a poll handle",
                    task.id
                )));
            };

            tokio::time::sleep(poll_interval).await;
            task.poll_attempts += 1;

            let api = &self.api;
            let handle = handle.as_str();
            let response = authorized(&self.tokens, &self.environment, self.request_timeout, |credential| {
                async move { api.poll_aggregate(&credential, handle).await }
            })
            .await?;

            match response {
                PollResponse::Processing => {
                    tracing::trace!(
                        target: "tabula::aggregation",
                        task_id = %task.id,
                        attempt = task.poll_attempts,
                        "[AggregationClient] Still processing"
                    );
                }
                PollResponse::Ready(rows) => task.succeed(rows),
                PollResponse::Failed { message, field } => task.fail(message, field),
            }
        }

        match task.state {
            TaskState::Succeeded => task
                .result
                .take()
                .ok_or_else(|| TabulaError::internal("succeeded task without result")),
            TaskState::Failed => Err(task
                .error
                .take()
                .unwrap_or_else(|| TabulaError::field_unsupported(None, "aggregation failed"))),
            _ => {
                tracing::warn!(
                    target: "tabula::aggregation",
                    task_id = %task.id,
                    attempts = task.poll_attempts,
                    "[AggregationClient] Poll budget exhausted"
                );
                Err(TabulaError::PollTimeout {
                    task_id: task.id.clone(),
                    attempts: task.poll_attempts,
                })
            }
        }
    }

    /// Submit plus await.
    pub async fn run(
        &self,
        query: QuerySpec,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Result<GroupedResult> {
        let task = self.submit(query).await?;
        self.await_result(task, poll_interval, max_polls).await
    }
}

/// True when `row` is a total/metadata row rather than a group.
pub fn is_summary_row(row: &Record, dimensions: &[FieldName]) -> bool {
    let marked = MARKER_KEYS
        .iter()
        .any(|key| row.get(*key).is_some_and(is_truthy));
    let typed = ROW_TYPE_KEYS.iter().any(|key| {
        row.get(*key)
            .and_then(Value::as_str)
            .is_some_and(|t| SUMMARY_ROW_TYPES.contains(&t.to_ascii_lowercase().as_str()))
    });
    marked || typed || dimensions.iter().any(|d| !row.contains_key(d))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !matches!(s.to_ascii_lowercase().as_str(), "" | "false" | "0" | "no"),
        _ => true,
    }
}

/// Finds a metric's value in a grouped row: `OP(field)`, then `field_op`, then `field`.
pub fn metric_value(row: &Record, metric: &Metric) -> Option<f64> {
    metric
        .column_candidates()
        .iter()
        .find_map(|column| row.get(column))
        .and_then(numeric_value)
}

/// Normalizes aggregation rows into a [`GroupedResult`].
pub fn grouped_from_rows(query: &QuerySpec, rows: Vec<Record>) -> GroupedResult {
    let mut result = GroupedResult::empty(
        query.dimensions.clone(),
        query.metrics.clone(),
        ResultSource::Aggregation,
    );

    for row in rows {
        if is_summary_row(&row, &query.dimensions) {
            result.summary.push(row);
            continue;
        }
        let key = query
            .dimensions
            .iter()
            .map(|d| row.get(d).cloned().unwrap_or(Value::Null))
            .collect();
        let values = query
            .metrics
            .iter()
            .map(|metric| match metric_value(&row, metric) {
                Some(value) => value,
                None => {
                    result.metadata.nulls_coerced += 1;
                    0.0
                }
            })
            .collect();
        result.rows.push(GroupedRow { key, values });
    }
    result
}
