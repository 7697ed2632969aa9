mod support;

use futures::TryStreamExt;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::{ENV, FakeIssuer, FakeTableApi, TABLE, ledger, token_manager};
use tabula_application::{FetchSettings, PaginatedFetcher};
use tabula_core::{ApiError, Filter, Page, Record, TabulaError};

fn settings(refresh_every_rows: u64) -> FetchSettings {
    FetchSettings {
        page_size: 500,
        refresh_every_rows,
        retry_attempts: 3,
        retry_backoff: Duration::from_millis(500),
        request_timeout: Duration::from_secs(60),
    }
}

fn fetcher(api: Arc<FakeTableApi>, issuer: Arc<FakeIssuer>, settings: FetchSettings) -> PaginatedFetcher {
    PaginatedFetcher::new(api, token_manager(issuer), ENV, settings)
}

fn ids(records: &[Record]) -> HashSet<u64> {
    records
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_u64))
        .collect()
}

#[tokio::test]
async fn test_unauthorized_mid_pagination_refreshes_once_without_gaps() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(54_390)));
    api.unauthorized_once_at(20_000);
    let issuer = Arc::new(FakeIssuer::new());
    let fetcher = fetcher(api.clone(), issuer.clone(), settings(0));

    let records: Vec<Record> = fetcher.fetch_all(TABLE, &[], None).try_collect().await.unwrap();

    assert_eq!(records.len(), 54_390);
    assert_eq!(ids(&records).len(), 54_390, "no duplicates, no gaps");
    assert_eq!(issuer.issues.load(Ordering::SeqCst), 1);
    assert_eq!(issuer.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(api.distinct_tokens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_after_server_error_refreshes_again() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(1_200)));
    api.script_page(
        500,
        [
            ApiError::Unauthorized { status: 401 },
            ApiError::Server {
                status: 503,
                message: "unavailable".into(),
            },
            ApiError::Unauthorized { status: 401 },
        ],
    );
    let issuer = Arc::new(FakeIssuer::new());
    let fetcher = fetcher(api.clone(), issuer.clone(), settings(0));

    let records: Vec<Record> = fetcher.fetch_all(TABLE, &[], None).try_collect().await.unwrap();

    assert_eq!(records.len(), 1_200);
    assert_eq!(ids(&records).len(), 1_200);
    assert_eq!(issuer.refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(api.distinct_tokens(), 3);
}

#[tokio::test]
async fn test_back_to_back_unauthorized_is_auth_expired() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(1_200)));
    api.script_page(
        500,
        [
            ApiError::Unauthorized { status: 401 },
            ApiError::Unauthorized { status: 401 },
        ],
    );
    let fetcher = fetcher(api.clone(), Arc::new(FakeIssuer::new()), settings(0));

    let err = fetcher
        .fetch_all(TABLE, &[], None)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert!(err.is_auth_expired(), "{:?}", err);
}

#[tokio::test]
async fn test_proactive_refresh_cadence() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(54_390)));
    let issuer = Arc::new(FakeIssuer::new());
    let fetcher = fetcher(api.clone(), issuer.clone(), settings(20_000));

    let records: Vec<Record> = fetcher.fetch_all(TABLE, &[], None).try_collect().await.unwrap();

    assert_eq!(records.len(), 54_390);
    // Before the pages at 20 000 and 40 000.
    assert_eq!(issuer.refreshes.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_server_errors_fail_with_offset() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(2_000)));
    api.fail_page(1_000, u32::MAX);
    let fetcher = fetcher(api.clone(), Arc::new(FakeIssuer::new()), settings(0));

    let err = fetcher
        .fetch_all(TABLE, &[], None)
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    match err {
        TabulaError::PageFetch {
            offset,
            attempts,
            status,
            ..
        } => {
            assert_eq!(offset, 1_000);
            assert_eq!(attempts, 4);
            assert_eq!(status, Some(502));
        }
        other => panic!("expected PageFetch, got {:?}", other),
    }
    // Two good pages, then one attempt plus three retries.
    assert_eq!(api.fetches(), 2 + 4);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_recover() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(1_200)));
    api.fail_page(500, 2);
    let fetcher = fetcher(api.clone(), Arc::new(FakeIssuer::new()), settings(0));

    let records: Vec<Record> = fetcher.fetch_all(TABLE, &[], None).try_collect().await.unwrap();

    assert_eq!(records.len(), 1_200);
    assert_eq!(api.fetches(), 3 + 2);
}

#[tokio::test]
async fn test_exact_multiple_ends_on_empty_page() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(1_000)));
    let fetcher = fetcher(api.clone(), Arc::new(FakeIssuer::new()), settings(0));

    let pages: Vec<Page> = fetcher.pages(TABLE, &[], 0, None).try_collect().await.unwrap();

    let sizes: Vec<usize> = pages.iter().map(|p| p.records.len()).collect();
    assert_eq!(sizes, vec![500, 500, 0]);
    assert!(pages.last().unwrap().is_last());
}

#[tokio::test]
async fn test_max_rows_caps_the_walk() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(54_390)));
    let fetcher = fetcher(api.clone(), Arc::new(FakeIssuer::new()), settings(0));

    let records: Vec<Record> = fetcher
        .fetch_all(TABLE, &[], Some(1_200))
        .try_collect()
        .await
        .unwrap();

    assert_eq!(records.len(), 1_200);
    assert_eq!(api.fetches(), 3);
}

#[tokio::test]
async fn test_fetch_from_offset_with_filters() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(3_000)));
    let fetcher = fetcher(api.clone(), Arc::new(FakeIssuer::new()), settings(0));
    let filters = [Filter::include("Scenario", ["Actual"])];

    let total = fetcher.count_rows(TABLE, &filters).await.unwrap();
    let tail: Vec<Record> = fetcher
        .fetch_from(TABLE, &filters, 900, None)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(total, 1_000);
    assert_eq!(tail.len(), 100);
    assert!(tail.iter().all(|r| r["Scenario"] == "Actual"));
}

#[tokio::test]
async fn test_page_size_is_capped() {
    let api = Arc::new(FakeTableApi::with_rows(ledger(1_200)));
    let mut oversized = settings(0);
    oversized.page_size = 10_000;
    let fetcher = fetcher(api, Arc::new(FakeIssuer::new()), oversized);

    let page = fetcher.pages(TABLE, &[], 0, None).try_next().await.unwrap().unwrap();
    assert_eq!(page.records.len(), 500);
}
