//! Paginated raw-record extraction with retry, backoff and token refresh.

use crate::call::with_deadline;
use crate::token_manager::TokenManager;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tabula_core::config::{ExtractionSettings, MAX_PAGE_SIZE};
use tabula_core::{ApiError, Credential, Filter, Page, Record, Result, TableApi, TabulaError};

/// Pagination tunables, derived from [`ExtractionSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    /// Rows per request, at most [`MAX_PAGE_SIZE`].
    pub page_size: u64,
    /// Proactive refresh cadence in rows (0 disables it).
    pub refresh_every_rows: u64,
    /// Retries per page for transient failures.
    pub retry_attempts: u32,
    /// First backoff delay; doubles per retry.
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
}

impl From<&ExtractionSettings> for FetchSettings {
    fn from(settings: &ExtractionSettings) -> Self {
        Self {
            page_size: settings.effective_page_size(),
            refresh_every_rows: settings.refresh_every_rows,
            retry_attempts: settings.page_retry_attempts,
            retry_backoff: settings.page_retry_backoff(),
            request_timeout: settings.request_timeout(),
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self::from(&ExtractionSettings::default())
    }
}

/// Walk state for [`PaginatedFetcher::pages`].
struct Cursor {
    table: String,
    filters: Vec<Filter>,
    offset: u64,
    remaining: Option<u64>,
    rows_since_refresh: u64,
    done: bool,
}

/// Sequential offset walker over the raw-record endpoint.
pub struct PaginatedFetcher {
    api: Arc<dyn TableApi>,
    tokens: Arc<TokenManager>,
    environment: String,
    settings: FetchSettings,
}

impl PaginatedFetcher {
    pub fn new(
        api: Arc<dyn TableApi>,
        tokens: Arc<TokenManager>,
        environment: impl Into<String>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            api,
            tokens,
            environment: environment.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    fn page_size(&self) -> u64 {
        self.settings.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Fetches one page, with auth recovery and transient retries.
    pub async fn fetch_page(
        &self,
        table: &str,
        filters: &[Filter],
        offset: u64,
        limit: u64,
    ) -> Result<Page> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let api = &self.api;
        let records = self
            .with_retries(offset, |credential| async move {
                api.fetch_page(&credential, table, filters, offset, limit).await
            })
            .await?;
        Ok(Page::new(offset, limit, records))
    }

    /// Total number of rows matching `filters`.
    pub async fn count_rows(&self, table: &str, filters: &[Filter]) -> Result<u64> {
        let api = &self.api;
        self.with_retries(0, |credential| async move {
            api.count_rows(&credential, table, filters).await
        })
        .await
    }

    /// Lazily walks pages from `start_offset` until a short page or `max_rows`.
    ///
    /// Every fetched page is yielded, including a final empty one.
    pub fn pages(
        &self,
        table: &str,
        filters: &[Filter],
        start_offset: u64,
        max_rows: Option<u64>,
    ) -> BoxStream<'_, Result<Page>> {
        let cursor = Cursor {
            table: table.to_string(),
            filters: filters.to_vec(),
            offset: start_offset,
            remaining: max_rows,
            rows_since_refresh: 0,
            done: false,
        };

        stream::try_unfold(cursor, move |mut cursor| async move {
            if cursor.done || cursor.remaining == Some(0) {
                return Ok(None);
            }

            let every = self.settings.refresh_every_rows;
            if every > 0 && cursor.rows_since_refresh >= every {
                tracing::info!(
                    target: "tabula::fetcher",
                    offset = cursor.offset,
                    rows = cursor.rows_since_refresh,
                    "[Fetcher] Refresh cadence reached"
                );
                self.tokens.proactive_refresh(&self.environment).await?;
                cursor.rows_since_refresh = 0;
            }

            let limit = match cursor.remaining {
                Some(remaining) => self.page_size().min(remaining),
                None => self.page_size(),
            };
            let page = self
                .fetch_page(&cursor.table, &cursor.filters, cursor.offset, limit)
                .await?;

            let fetched = page.records.len() as u64;
            cursor.offset = page.next_offset();
            cursor.rows_since_refresh += fetched;
            if let Some(remaining) = cursor.remaining.as_mut() {
                *remaining = remaining.saturating_sub(fetched);
            }
            if page.is_last() {
                cursor.done = true;
            }

            tracing::debug!(
                target: "tabula::fetcher",
                table = %cursor.table,
                offset = page.offset,
                rows = fetched,
                "[Fetcher] Page fetched"
            );
            Ok::<_, TabulaError>(Some((page, cursor)))
        })
        .boxed()
    }

    /// Every row from offset 0, capped at `max_rows`.
    pub fn fetch_all(
        &self,
        table: &str,
        filters: &[Filter],
        max_rows: Option<u64>,
    ) -> BoxStream<'_, Result<Record>> {
        self.fetch_from(table, filters, 0, max_rows)
    }

    /// Every row from `start_offset`, capped at `max_rows`.
    pub fn fetch_from(
        &self,
        table: &str,
        filters: &[Filter],
        start_offset: u64,
        max_rows: Option<u64>,
    ) -> BoxStream<'_, Result<Record>> {
        self.pages(table, filters, start_offset, max_rows)
            .map_ok(|page| stream::iter(page.records.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    /// Retry loop for one request at `offset`.
    ///
    /// - 401: one forced refresh, then `AuthExpired` if the retry is rejected too
    /// - 5xx, network, timeout: exponential backoff, `retry_attempts` retries
    /// - anything else: returned as is
    async fn with_retries<T, F, Fut>(&self, offset: u64, mut op: F) -> Result<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let mut reauthenticated = false;
        let mut failures: u32 = 0;

        loop {
            let credential = self.tokens.get_valid_token(&self.environment).await?;
            let error = match with_deadline(self.settings.request_timeout, op(credential.clone())).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if error.is_unauthorized() {
                if reauthenticated {
                    return Err(TabulaError::auth_expired(
                        &self.environment,
                        format!("request at offset {} rejected again after token refresh", offset),
                    ));
                }
                tracing::warn!(
                    target: "tabula::fetcher",
                    offset,
                    "[Fetcher] Token rejected mid-fetch, refreshing and retrying page"
                );
                self.tokens
                    .refresh_rejected(&self.environment, &credential)
                    .await?;
                reauthenticated = true;
                continue;
            }

            if error.is_transient() {
                // Only back-to-back 401s on this page are fatal.
                reauthenticated = false;
                failures += 1;
                if failures > self.settings.retry_attempts {
                    return Err(TabulaError::PageFetch {
                        offset,
                        attempts: failures,
                        status: error.status(),
                        message: error.to_string(),
                    });
                }
                let delay = self.settings.retry_backoff * 2u32.saturating_pow(failures - 1);
                tracing::warn!(
                    target: "tabula::fetcher",
                    offset,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "[Fetcher] Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(error.into_tabula(&self.environment));
        }
    }
}
