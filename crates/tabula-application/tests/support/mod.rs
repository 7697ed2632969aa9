//! Scripted in-memory backend shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabula_application::{
    AggregationClient, ExtractionOrchestrator, FetchSettings, IncrementalCache, PaginatedFetcher,
    ProfileStore, TableCatalog, TokenManager,
};
use tabula_core::config::ExtractionSettings;
use tabula_core::{
    AggOp, AggregateSubmission, ApiError, CompatibilityProfile, Credential, FieldInfo, Filter,
    PollResponse, QuerySpec, Record, SessionCredential, TableApi, TableInfo, TableSchema,
    TokenIssuer,
};
use tabula_infrastructure::{
    InMemoryCredentialStore, InMemoryProfileRepository, InMemorySnapshotRepository,
};

pub const ENV: &str = "app";
pub const TABLE: &str = "16528";

const SCENARIOS: [&str; 3] = ["Actual", "Budget", "Forecast"];

/// Deterministic ledger row number `i`.
pub fn ledger_row(i: u64) -> Record {
    let amount = if i % 97 == 0 {
        Value::Null
    } else {
        json!((i % 100) as f64 * 1.5)
    };
    json!({
        "id": i,
        "Scenario": SCENARIOS[(i % 3) as usize],
        "AccountL1": format!("L1-{}", i % 5),
        "AccountL1_5": format!("L15-{}", i % 4),
        "Amount": amount,
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

pub fn ledger(rows: u64) -> Vec<Record> {
    (0..rows).map(ledger_row).collect()
}

/// How the aggregation endpoint answers accepted queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    /// 200 with rows on submit.
    Sync,
    /// 202, then `Processing` for this many polls before the rows.
    Async { polls_before_ready: u32 },
    /// 202, then `Processing` forever.
    NeverReady,
}

/// Backend double for [`TableApi`].
///
/// Serves raw rows from an in-memory table, aggregates SUM/COUNT itself,
/// and can be scripted to reject fields or fail requests.
pub struct FakeTableApi {
    rows: Mutex<Vec<Record>>,
    mode: Mutex<AggregateMode>,
    rejected_fields: Mutex<HashSet<String>>,
    /// One 401 for the first request at this offset.
    unauthorized_at: Mutex<Option<u64>>,
    /// Remaining 5xx answers per offset (`u32::MAX` means forever).
    page_failures: Mutex<HashMap<u64, u32>>,
    /// Errors returned, in order, by the next requests at an offset.
    page_scripts: Mutex<HashMap<u64, VecDeque<ApiError>>>,
    /// Time every page and count request takes.
    fetch_delay: Mutex<Duration>,
    /// Remaining 503 answers from the aggregation submit.
    submit_failures: AtomicU32,
    /// Accepted tasks: polls left before ready, and the query behind them.
    pending: Mutex<HashMap<String, (u32, QuerySpec)>>,
    tokens_seen: Mutex<Vec<String>>,
    pub fetch_calls: AtomicUsize,
    pub count_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    pub schema_calls: AtomicUsize,
}

impl FakeTableApi {
    pub fn with_rows(rows: Vec<Record>) -> Self {
        Self {
            rows: Mutex::new(rows),
            mode: Mutex::new(AggregateMode::Sync),
            rejected_fields: Mutex::new(HashSet::new()),
            unauthorized_at: Mutex::new(None),
            page_failures: Mutex::new(HashMap::new()),
            page_scripts: Mutex::new(HashMap::new()),
            fetch_delay: Mutex::new(Duration::ZERO),
            submit_failures: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            tokens_seen: Mutex::new(Vec::new()),
            fetch_calls: AtomicUsize::new(0),
            count_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            schema_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: AggregateMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn reject_field(&self, field: &str) {
        self.rejected_fields.lock().unwrap().insert(field.to_string());
    }

    pub fn unauthorized_once_at(&self, offset: u64) {
        *self.unauthorized_at.lock().unwrap() = Some(offset);
    }

    pub fn fail_page(&self, offset: u64, times: u32) {
        self.page_failures.lock().unwrap().insert(offset, times);
    }

    /// The next requests at `offset` fail with `errors`, one each.
    pub fn script_page(&self, offset: u64, errors: impl IntoIterator<Item = ApiError>) {
        self.page_scripts
            .lock()
            .unwrap()
            .insert(offset, errors.into_iter().collect());
    }

    /// Page and count requests take `delay`, so concurrent syncs overlap.
    pub fn slow_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn fail_submits(&self, times: u32) {
        self.submit_failures.store(times, Ordering::SeqCst);
    }

    pub fn push_rows(&self, rows: impl IntoIterator<Item = Record>) {
        self.rows.lock().unwrap().extend(rows);
    }

    pub fn truncate(&self, len: usize) {
        self.rows.lock().unwrap().truncate(len);
    }

    pub fn update_row(&self, index: usize, field: &str, value: Value) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(index) {
            row.insert(field.to_string(), value);
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn distinct_tokens(&self) -> usize {
        let seen = self.tokens_seen.lock().unwrap();
        seen.iter().collect::<HashSet<_>>().len()
    }

    pub fn schema_loads(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn seen(&self, credential: &Credential) {
        self.tokens_seen
            .lock()
            .unwrap()
            .push(credential.access_token.clone());
    }

    fn matching(&self, filters: &[Filter]) -> Vec<Record> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| {
                filters.iter().all(|filter| {
                    let value = row
                        .get(&filter.name)
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    filter.values.iter().any(|v| v == value) != filter.is_excluded
                })
            })
            .cloned()
            .collect()
    }

    fn rejected_in(&self, query: &QuerySpec) -> Option<String> {
        let rejected = self.rejected_fields.lock().unwrap();
        query
            .referenced_fields()
            .into_iter()
            .find(|field| rejected.contains(field))
    }

    /// Server-side grouping: SUM and COUNT, plus a trailing total row.
    fn aggregate_rows(&self, query: &QuerySpec) -> Vec<Record> {
        let mut groups: BTreeMap<Vec<String>, Vec<f64>> = BTreeMap::new();
        for row in self.matching(&query.filters) {
            let key: Vec<String> = query
                .dimensions
                .iter()
                .map(|d| row.get(d).and_then(Value::as_str).unwrap_or_default().to_string())
                .collect();
            let values = groups
                .entry(key)
                .or_insert_with(|| vec![0.0; query.metrics.len()]);
            for (slot, metric) in values.iter_mut().zip(&query.metrics) {
                let cell = row.get(&metric.field).and_then(Value::as_f64);
                *slot += match metric.op {
                    AggOp::Count => 1.0,
                    _ => cell.unwrap_or(0.0),
                };
            }
        }

        let mut rows: Vec<Record> = groups
            .into_iter()
            .map(|(key, values)| {
                let mut record = Record::new();
                for (dimension, value) in query.dimensions.iter().zip(key) {
                    record.insert(dimension.clone(), json!(value));
                }
                for (metric, value) in query.metrics.iter().zip(values) {
                    record.insert(
                        format!("{}({})", metric.op.as_str(), metric.field),
                        json!(value),
                    );
                }
                record
            })
            .collect();
        let mut total = Record::new();
        total.insert("_is_total".into(), json!(true));
        rows.push(total);
        rows
    }
}

#[async_trait]
impl TableApi for FakeTableApi {
    async fn fetch_page(
        &self,
        credential: &Credential,
        _table: &str,
        filters: &[Filter],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.seen(credential);
        self.pause().await;

        let scripted = self
            .page_scripts
            .lock()
            .unwrap()
            .get_mut(&offset)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }
        {
            let mut unauthorized = self.unauthorized_at.lock().unwrap();
            if *unauthorized == Some(offset) {
                *unauthorized = None;
                return Err(ApiError::Unauthorized { status: 401 });
            }
        }
        {
            let mut failures = self.page_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&offset) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(ApiError::Server {
                        status: 502,
                        message: "bad gateway".into(),
                    });
                }
            }
        }

        Ok(self
            .matching(filters)
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count_rows(
        &self,
        credential: &Credential,
        _table: &str,
        filters: &[Filter],
    ) -> Result<u64, ApiError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        self.seen(credential);
        self.pause().await;
        Ok(self.matching(filters).len() as u64)
    }

    async fn submit_aggregate(
        &self,
        credential: &Credential,
        query: &QuerySpec,
    ) -> Result<AggregateSubmission, ApiError> {
        let call = self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.seen(credential);

        if self
            .submit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ApiError::Server {
                status: 503,
                message: "aggregation service unavailable".into(),
            });
        }
        if let Some(field) = self.rejected_in(query) {
            return Ok(AggregateSubmission::Rejected {
                message: format!("Cannot aggregate on field {}", field),
                field: Some(field),
            });
        }

        let mode = *self.mode.lock().unwrap();
        match mode {
            AggregateMode::Sync => Ok(AggregateSubmission::Ready(self.aggregate_rows(query))),
            AggregateMode::Async { polls_before_ready } => {
                let handle = format!("task-{}", call);
                self.pending
                    .lock()
                    .unwrap()
                    .insert(handle.clone(), (polls_before_ready, query.clone()));
                Ok(AggregateSubmission::Accepted { handle })
            }
            AggregateMode::NeverReady => Ok(AggregateSubmission::Accepted {
                handle: format!("task-{}", call),
            }),
        }
    }

    async fn poll_aggregate(
        &self,
        credential: &Credential,
        handle: &str,
    ) -> Result<PollResponse, ApiError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.seen(credential);

        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(handle) {
            Some((0, _)) => {
                let (_, query) = pending.remove(handle).unwrap();
                drop(pending);
                Ok(PollResponse::Ready(self.aggregate_rows(&query)))
            }
            Some((remaining, _)) => {
                *remaining -= 1;
                Ok(PollResponse::Processing)
            }
            None => Ok(PollResponse::Processing),
        }
    }

    async fn list_tables(&self, credential: &Credential) -> Result<Vec<TableInfo>, ApiError> {
        self.seen(credential);
        Ok(vec![TableInfo {
            id: TABLE.into(),
            name: Some("Ledger".into()),
            alias: None,
        }])
    }

    async fn table_schema(
        &self,
        credential: &Credential,
        table: &str,
    ) -> Result<TableSchema, ApiError> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        self.seen(credential);
        if table != TABLE {
            return Err(ApiError::Client {
                status: 404,
                message: format!("no table {}", table),
            });
        }
        let field = |name: &str, field_type: &str| FieldInfo {
            name: name.into(),
            field_type: Some(field_type.into()),
            alias: None,
        };
        Ok(TableSchema {
            table: TABLE.into(),
            name: Some("Ledger".into()),
            alias: None,
            fields: vec![
                field("id", "integer"),
                field("Scenario", "string"),
                field("AccountL1", "string"),
                field("AccountL1_5", "string"),
                field("Amount", "number"),
            ],
        })
    }

    async fn distinct_values(
        &self,
        credential: &Credential,
        _table: &str,
        field: &str,
    ) -> Result<Vec<Value>, ApiError> {
        self.seen(credential);
        let distinct: BTreeMap<String, Value> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter_map(|row| row.get(field))
            .filter(|value| !value.is_null())
            .map(|value| (value.to_string(), value.clone()))
            .collect();
        Ok(distinct.into_values().collect())
    }
}

/// Token issuer double that counts network calls.
pub struct FakeIssuer {
    pub issues: AtomicUsize,
    pub refreshes: AtomicUsize,
    delay: Duration,
    reject_issue: bool,
}

impl FakeIssuer {
    pub fn new() -> Self {
        Self {
            issues: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            delay: Duration::ZERO,
            reject_issue: false,
        }
    }

    /// Every call takes `delay`, so concurrent callers overlap.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// Session exchange always answers 401.
    pub fn revoked() -> Self {
        Self {
            reject_issue: true,
            ..Self::new()
        }
    }

    pub fn network_calls(&self) -> usize {
        self.issues.load(Ordering::SeqCst) + self.refreshes.load(Ordering::SeqCst)
    }

    fn credential(&self, serial: usize) -> Credential {
        Credential::from_tokens(
            format!("access-{}", serial),
            Some(format!("refresh-{}", serial)),
            "csrf",
        )
    }
}

#[async_trait]
impl TokenIssuer for FakeIssuer {
    async fn issue(
        &self,
        _environment: &str,
        _session: &SessionCredential,
    ) -> Result<Credential, ApiError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.reject_issue {
            return Err(ApiError::Unauthorized { status: 401 });
        }
        let serial = self.issues.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.credential(serial))
    }

    async fn refresh(
        &self,
        _environment: &str,
        _session: &SessionCredential,
        _refresh_token: &str,
    ) -> Result<Credential, ApiError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let serial = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1000;
        Ok(self.credential(serial))
    }
}

pub fn session_store() -> Arc<InMemoryCredentialStore> {
    Arc::new(InMemoryCredentialStore::with_session(
        ENV,
        SessionCredential::new("session", "csrf"),
    ))
}

pub fn token_manager(issuer: Arc<FakeIssuer>) -> Arc<TokenManager> {
    Arc::new(TokenManager::new(issuer, session_store()))
}

/// Fast settings: small pages, no proactive refresh, short delays.
pub fn test_settings() -> ExtractionSettings {
    ExtractionSettings {
        page_size: 500,
        refresh_every_rows: 0,
        page_retry_attempts: 3,
        page_retry_backoff_ms: 10,
        poll_interval_ms: 10,
        max_polls: 5,
        aggregation_retries: 2,
        aggregation_concurrency: 3,
        ..ExtractionSettings::default()
    }
}

/// Everything an orchestrator test needs, wired over one fake backend.
pub struct Harness {
    pub api: Arc<FakeTableApi>,
    pub issuer: Arc<FakeIssuer>,
    pub tokens: Arc<TokenManager>,
    pub fetcher: Arc<PaginatedFetcher>,
    pub profiles: Arc<ProfileStore>,
    pub snapshots: Arc<InMemorySnapshotRepository>,
    pub cache: Arc<IncrementalCache>,
    pub catalog: Arc<TableCatalog>,
    pub orchestrator: ExtractionOrchestrator,
}

impl Harness {
    pub fn new(rows: Vec<Record>) -> Self {
        Self::build(rows, None, test_settings(), FakeIssuer::new())
    }

    pub fn with_profile(rows: Vec<Record>, profile: CompatibilityProfile) -> Self {
        Self::build(rows, Some(profile), test_settings(), FakeIssuer::new())
    }

    pub fn build(
        rows: Vec<Record>,
        profile: Option<CompatibilityProfile>,
        settings: ExtractionSettings,
        issuer: FakeIssuer,
    ) -> Self {
        let api = Arc::new(FakeTableApi::with_rows(rows));
        let issuer = Arc::new(issuer);
        let tokens = token_manager(issuer.clone());
        let fetcher = Arc::new(PaginatedFetcher::new(
            api.clone(),
            tokens.clone(),
            ENV,
            FetchSettings::from(&settings),
        ));
        let repository = match profile {
            Some(profile) => InMemoryProfileRepository::with_profile(profile),
            None => InMemoryProfileRepository::new(),
        };
        let profiles = Arc::new(ProfileStore::new(Arc::new(repository)));
        let snapshots = Arc::new(InMemorySnapshotRepository::new());
        let cache = Arc::new(IncrementalCache::new(fetcher.clone(), snapshots.clone()));
        let aggregation = AggregationClient::new(
            api.clone(),
            tokens.clone(),
            ENV,
            settings.request_timeout(),
        );
        let catalog = Arc::new(TableCatalog::new(
            api.clone(),
            tokens.clone(),
            ENV,
            settings.request_timeout(),
        ));
        let orchestrator =
            ExtractionOrchestrator::new(ENV, settings, profiles.clone(), aggregation, fetcher.clone())
                .with_cache(cache.clone())
                .with_catalog(catalog.clone());

        Self {
            api,
            issuer,
            tokens,
            fetcher,
            profiles,
            snapshots,
            cache,
            catalog,
            orchestrator,
        }
    }
}

impl Harness {
    /// A second aggregation client over the same backend and tokens.
    pub fn aggregation(&self) -> AggregationClient {
        AggregationClient::new(
            self.api.clone(),
            self.tokens.clone(),
            ENV,
            Duration::from_secs(60),
        )
    }
}
