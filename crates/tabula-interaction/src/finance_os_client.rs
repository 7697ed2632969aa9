//! reqwest implementation of [`TableApi`] against the Finance OS table API.

use crate::response::{
    classify_status, parse_count, parse_distinct, parse_poll, parse_records, parse_schema,
    parse_submission, parse_tables,
};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use serde::Serialize;
use std::time::Duration;
use tabula_core::config::EnvironmentConfig;
use serde_json::Value;
use tabula_core::{
    AggregateSubmission, ApiError, Credential, Filter, Metric, PollResponse, QuerySpec, Record,
    Result, TableApi, TableInfo, TableSchema, TabulaError,
};

const CSRF_HEADER: &str = "X-CSRFToken";

#[derive(Debug, Serialize)]
struct DataRequest<'a> {
    filters: &'a [Filter],
    limit: u64,
    offset: u64,
}

#[derive(Debug, Serialize)]
struct AggregateRequest<'a> {
    dimensions: &'a [String],
    metrics: &'a [Metric],
    filters: &'a [Filter],
}

/// Talks to `<base_url>/finance-os/api/tables/v1/...`.
#[derive(Debug, Clone)]
pub struct HttpTableApi {
    client: Client,
    base_url: String,
    api_root: String,
}

impl HttpTableApi {
    /// Creates a client for one environment. `timeout` bounds each HTTP call.
    pub fn new(environment: &EnvironmentConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TabulaError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, environment))
    }

    /// Uses an existing reqwest client (shared connection pool).
    pub fn with_client(client: Client, environment: &EnvironmentConfig) -> Self {
        Self {
            client,
            base_url: environment.base_url.trim_end_matches('/').to_string(),
            api_root: environment.api_root(),
        }
    }

    fn table_url(&self, table: &str, action: &str) -> String {
        format!("{}/tables/v1/{}/{}", self.api_root, table, action)
    }

    /// Resolves a poll handle (absolute URL or server-relative path).
    fn poll_url(&self, handle: &str) -> String {
        if handle.starts_with("http://") || handle.starts_with("https://") {
            handle.to_string()
        } else if handle.starts_with('/') {
            format!("{}{}", self.base_url, handle)
        } else {
            format!("{}/{}", self.api_root, handle)
        }
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        credential: &Credential,
        url: &str,
        body: &B,
    ) -> std::result::Result<reqwest::Response, ApiError> {
        self.client
            .post(url)
            .header(AUTHORIZATION, credential.bearer())
            .header(CSRF_HEADER, &credential.csrf_token)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn get_json(
        &self,
        credential: &Credential,
        url: &str,
    ) -> std::result::Result<Value, ApiError> {
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, credential.bearer())
            .header(CSRF_HEADER, &credential.csrf_token)
            .send()
            .await
            .map_err(transport_error)?;
        Self::read_json(response).await
    }

    async fn read_json(
        response: reqwest::Response,
    ) -> std::result::Result<serde_json::Value, ApiError> {
        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport_error)?;
        if !(200..300).contains(&status) {
            return Err(classify_status(status, &text));
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Maps reqwest transport failures onto [`ApiError`].
fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else if err.is_decode() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::Network(err.to_string())
    }
}

#[async_trait]
impl TableApi for HttpTableApi {
    async fn fetch_page(
        &self,
        credential: &Credential,
        table: &str,
        filters: &[Filter],
        offset: u64,
        limit: u64,
    ) -> std::result::Result<Vec<Record>, ApiError> {
        let url = self.table_url(table, "data");
        tracing::trace!(target: "tabula::http", %url, offset, limit, "POST data page");

        let response = self
            .post_json(credential, &url, &DataRequest { filters, limit, offset })
            .await?;
        parse_records(Self::read_json(response).await?)
    }

    async fn count_rows(
        &self,
        credential: &Credential,
        table: &str,
        filters: &[Filter],
    ) -> std::result::Result<u64, ApiError> {
        let url = self.table_url(table, "data");
        let request = DataRequest {
            filters,
            limit: 1,
            offset: 0,
        };
        let response = self.post_json(credential, &url, &request).await?;
        parse_count(&Self::read_json(response).await?)
    }

    async fn submit_aggregate(
        &self,
        credential: &Credential,
        query: &QuerySpec,
    ) -> std::result::Result<AggregateSubmission, ApiError> {
        let url = self.table_url(&query.table, "aggregate");
        let request = AggregateRequest {
            dimensions: &query.dimensions,
            metrics: &query.metrics,
            filters: &query.filters,
        };
        tracing::debug!(
            target: "tabula::http",
            %url,
            dimensions = ?query.dimensions,
            metrics = query.metrics.len(),
            "POST aggregate"
        );

        let response = self.post_json(credential, &url, &request).await?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(transport_error)?;

        parse_submission(status, location.as_deref(), &body, &url)
    }

    async fn poll_aggregate(
        &self,
        credential: &Credential,
        handle: &str,
    ) -> std::result::Result<PollResponse, ApiError> {
        let url = self.poll_url(handle);
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, credential.bearer())
            .header(CSRF_HEADER, &credential.csrf_token)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;

        parse_poll(status, &body)
    }

    async fn list_tables(
        &self,
        credential: &Credential,
    ) -> std::result::Result<Vec<TableInfo>, ApiError> {
        let url = format!("{}/tables/v1/", self.api_root);
        tracing::debug!(target: "tabula::http", %url, "GET table listing");
        parse_tables(self.get_json(credential, &url).await?)
    }

    async fn table_schema(
        &self,
        credential: &Credential,
        table: &str,
    ) -> std::result::Result<TableSchema, ApiError> {
        let url = format!("{}/tables/v1/{}", self.api_root, table);
        tracing::debug!(target: "tabula::http", %url, "GET table schema");
        parse_schema(table, self.get_json(credential, &url).await?)
    }

    async fn distinct_values(
        &self,
        credential: &Credential,
        table: &str,
        field: &str,
    ) -> std::result::Result<Vec<Value>, ApiError> {
        let url = self.table_url(table, &format!("fields/by-name/{}/distinct", field));
        tracing::debug!(target: "tabula::http", %url, "GET distinct values");
        parse_distinct(self.get_json(credential, &url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> HttpTableApi {
        HttpTableApi::new(
            &EnvironmentConfig::conventional("app"),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let api = api();
        assert_eq!(
            api.table_url("16528", "data"),
            "https://app.datarails.com/finance-os/api/tables/v1/16528/data"
        );
        assert_eq!(
            api.poll_url("/finance-os/api/tasks/7"),
            "https://app.datarails.com/finance-os/api/tasks/7"
        );
        assert_eq!(api.poll_url("https://other/x"), "https://other/x");
        assert_eq!(
            api.table_url("16528", "fields/by-name/Scenario/distinct"),
            "https://app.datarails.com/finance-os/api/tables/v1/16528/fields/by-name/Scenario/distinct"
        );
    }

    #[test]
    fn test_request_bodies() {
        let filters = [Filter::include("Scenario", ["Actuals"])];
        let body = serde_json::to_value(DataRequest {
            filters: &filters,
            limit: 500,
            offset: 1000,
        })
        .unwrap();
        assert_eq!(body["limit"], 500);
        assert_eq!(body["filters"][0]["is_excluded"], false);

        let query = QuerySpec::new("16528")
            .group_by("Scenario")
            .metric(Metric::sum("Amount"));
        let body = serde_json::to_value(AggregateRequest {
            dimensions: &query.dimensions,
            metrics: &query.metrics,
            filters: &query.filters,
        })
        .unwrap();
        assert_eq!(body["metrics"][0]["agg"], "SUM");
        assert_eq!(body["dimensions"][0], "Scenario");
    }
}
