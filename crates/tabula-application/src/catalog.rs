//! Table discovery: listings, schemas and distinct field values.

use crate::call::authorized;
use crate::token_manager::TokenManager;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabula_core::{Result, TableApi, TableInfo, TableSchema};
use tokio::sync::RwLock;

/// Distinct values returned when the caller gives no limit.
pub const DEFAULT_DISTINCT_LIMIT: usize = 100;

/// Discovery calls against one environment.
///
/// Schemas rarely change within a run and are cached per table until
/// [`TableCatalog::forget_schema`] is called.
pub struct TableCatalog {
    api: Arc<dyn TableApi>,
    tokens: Arc<TokenManager>,
    environment: String,
    request_timeout: Duration,
    schemas: RwLock<HashMap<String, TableSchema>>,
}

impl TableCatalog {
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
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        let api = &self.api;
        let tables = authorized(&self.tokens, &self.environment, self.request_timeout, |credential| {
            async move { api.list_tables(&credential).await }
        })
        .await?;
        tracing::debug!(
            target: "tabula::catalog",
            tables = tables.len(),
            "[Catalog] Tables listed"
        );
        Ok(tables)
    }

    /// Column definitions of `table`, from the cache when present.
    pub async fn schema(&self, table: &str) -> Result<TableSchema> {
        if let Some(schema) = self.schemas.read().await.get(table) {
            return Ok(schema.clone());
        }

        let api = &self.api;
        let schema = authorized(&self.tokens, &self.environment, self.request_timeout, |credential| {
            async move { api.table_schema(&credential, table).await }
        })
        .await?;
        tracing::debug!(
            target: "tabula::catalog",
            table,
            fields = schema.fields.len(),
            "[Catalog] Schema loaded"
        );

        self.schemas
            .write()
            .await
            .insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    pub async fn forget_schema(&self, table: &str) {
        self.schemas.write().await.remove(table);
    }

    /// Up to `limit` distinct values of `field` (default [`DEFAULT_DISTINCT_LIMIT`]).
    pub async fn distinct_values(
        &self,
        table: &str,
        field: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let api = &self.api;
        let mut values = authorized(&self.tokens, &self.environment, self.request_timeout, |credential| {
            async move { api.distinct_values(&credential, table, field).await }
        })
        .await?;
        values.truncate(limit.unwrap_or(DEFAULT_DISTINCT_LIMIT));
        Ok(values)
    }
}
