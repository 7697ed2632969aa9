//! Transport seam between the extraction engine and the remote finance API.
//!
//! The engine talks to the backend only through [`TableApi`]. The reqwest
//! implementation lives in `tabula-interaction`; tests substitute scripted
//! in-memory backends.

use crate::catalog::{TableInfo, TableSchema};
use crate::credential::Credential;
use crate::error::TabulaError;
use crate::query::{Filter, QuerySpec, Record};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure of a single backend call, before any retry policy is applied.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// 401/403: the bearer token (or the session behind it) was rejected.
    #[error("unauthorized ({status})")]
    Unauthorized { status: u16 },

    /// 5xx: transient server failure.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Other 4xx: the request itself is wrong.
    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },

    /// Connection failure, reset, DNS.
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete within its deadline.
    #[error("request timed out")]
    Timeout,

    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// Failures worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Server { .. } | ApiError::Network(_) | ApiError::Timeout
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized { status }
            | ApiError::Server { status, .. }
            | ApiError::Client { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Converts into the engine error once no local recovery applies.
    pub fn into_tabula(self, environment: &str) -> TabulaError {
        match self {
            ApiError::Unauthorized { status } => TabulaError::auth_expired(
                environment,
                format!("request rejected with status {}", status),
            ),
            ApiError::Client { status, message } => TabulaError::Api { status, message },
            other => TabulaError::Network(other.to_string()),
        }
    }
}

/// Outcome of posting an aggregation query.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateSubmission {
    /// The backend answered synchronously.
    Ready(Vec<Record>),
    /// `202 Accepted`: poll `handle` until the task finishes.
    Accepted { handle: String },
    /// The backend refused the query outright (typically an unsupported field).
    Rejected {
        message: String,
        field: Option<String>,
    },
}

/// One answer from the poll endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResponse {
    Ready(Vec<Record>),
    Processing,
    Failed {
        message: String,
        field: Option<String>,
    },
}

/// Data, aggregation and discovery endpoints of the finance table API.
#[async_trait]
pub trait TableApi: Send + Sync {
    /// Fetches `limit` raw rows starting at `offset`.
    async fn fetch_page(
        &self,
        credential: &Credential,
        table: &str,
        filters: &[Filter],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>, ApiError>;

    /// Returns the total number of rows matching `filters`.
    async fn count_rows(
        &self,
        credential: &Credential,
        table: &str,
        filters: &[Filter],
    ) -> Result<u64, ApiError>;

    /// Posts an aggregation query.
    async fn submit_aggregate(
        &self,
        credential: &Credential,
        query: &QuerySpec,
    ) -> Result<AggregateSubmission, ApiError>;

    /// Polls an accepted aggregation task.
    async fn poll_aggregate(
        &self,
        credential: &Credential,
        handle: &str,
    ) -> Result<PollResponse, ApiError>;

    /// Lists the tables visible to the caller.
    async fn list_tables(&self, credential: &Credential) -> Result<Vec<TableInfo>, ApiError>;

    /// Returns the column definitions of `table`.
    async fn table_schema(
        &self,
        credential: &Credential,
        table: &str,
    ) -> Result<TableSchema, ApiError>;

    /// Returns the distinct values of `field` in `table`.
    async fn distinct_values(
        &self,
        credential: &Credential,
        table: &str,
        field: &str,
    ) -> Result<Vec<Value>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ApiError::Unauthorized { status: 401 }.is_unauthorized());
        assert!(
            ApiError::Server {
                status: 502,
                message: String::new()
            }
            .is_transient()
        );
        assert!(ApiError::Timeout.is_transient());
        assert!(
            !ApiError::Client {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_into_tabula() {
        let err = ApiError::Unauthorized { status: 401 }.into_tabula("app");
        assert!(err.is_auth_expired());

        let err = ApiError::Client {
            status: 404,
            message: "no table".into(),
        }
        .into_tabula("app");
        assert!(matches!(err, TabulaError::Api { status: 404, .. }));

        let err = ApiError::Timeout.into_tabula("app");
        assert!(err.is_retryable());
    }
}
