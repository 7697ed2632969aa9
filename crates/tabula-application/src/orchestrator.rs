//! Extraction façade: picks the backend path per query and recovers from
//! compatibility and infrastructure failures.

use crate::aggregation::AggregationClient;
use crate::cache::IncrementalCache;
use crate::catalog::TableCatalog;
use crate::client_aggregator::aggregate_stream;
use crate::fetcher::PaginatedFetcher;
use crate::profile_store::ProfileStore;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tabula_core::config::{ExtractionSettings, MAX_PAGE_SIZE};
use tabula_core::profile::{CompatibilityObservation, CompatibilityProfile, ObservationKind};
use tabula_core::{
    FieldName, Filter, GroupedResult, QuerySpec, Record, Result, TableInfo, TableSchema, TabulaError,
};

/// Most rows [`ExtractionOrchestrator::sample`] returns.
pub const SAMPLE_MAX_ROWS: u64 = 20;

/// Most rows [`ExtractionOrchestrator::filtered`] returns.
pub const FILTERED_MAX_ROWS: u64 = MAX_PAGE_SIZE;

/// Options for [`ExtractionOrchestrator::extract_raw`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Serve uncapped extractions through the incremental cache.
    pub use_cache: bool,
}

/// How the caller's fields map onto queried fields for one attempt.
#[derive(Debug, Clone, Default)]
struct FieldPlan {
    /// Caller field to the field actually sent to the backend.
    queried: BTreeMap<FieldName, FieldName>,
}

impl FieldPlan {
    fn query_for(&self, spec: &QuerySpec) -> QuerySpec {
        spec.map_fields(|field| self.queried_name(field))
    }

    fn queried_name(&self, field: &str) -> FieldName {
        self.queried
            .get(field)
            .cloned()
            .unwrap_or_else(|| field.to_string())
    }

    /// Queried field back to caller field, for relabeling.
    fn renames(&self) -> BTreeMap<FieldName, FieldName> {
        self.substitutions()
            .into_iter()
            .map(|(caller, queried)| (queried, caller))
            .collect()
    }

    fn substitutions(&self) -> BTreeMap<FieldName, FieldName> {
        self.queried
            .iter()
            .filter(|(caller, queried)| caller != queried)
            .map(|(caller, queried)| (caller.clone(), queried.clone()))
            .collect()
    }
}

/// Compatibility observations waiting to be folded into the profile.
///
/// A panic while the lock was held must not lose what was recorded, so a
/// poisoned lock is logged and its contents recovered.
#[derive(Debug, Default)]
struct ObservationLog(Mutex<Vec<CompatibilityObservation>>);

impl ObservationLog {
    fn push(&self, observation: CompatibilityObservation) {
        self.entries().push(observation);
    }

    fn drain(&self) -> Vec<CompatibilityObservation> {
        std::mem::take(&mut *self.entries())
    }

    fn entries(&self) -> MutexGuard<'_, Vec<CompatibilityObservation>> {
        self.0.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(
                target: "tabula::orchestrator",
                "[Orchestrator] Observation log lock poisoned, recovering its contents"
            );
            poisoned.into_inner()
        })
    }
}

pub struct ExtractionOrchestrator {
    environment: String,
    settings: ExtractionSettings,
    profiles: Arc<ProfileStore>,
    aggregation: AggregationClient,
    fetcher: Arc<PaginatedFetcher>,
    cache: Option<Arc<IncrementalCache>>,
    catalog: Option<Arc<TableCatalog>>,
    observations: ObservationLog,
}

impl ExtractionOrchestrator {
    pub fn new(
        environment: impl Into<String>,
        settings: ExtractionSettings,
        profiles: Arc<ProfileStore>,
        aggregation: AggregationClient,
        fetcher: Arc<PaginatedFetcher>,
    ) -> Self {
        Self {
            environment: environment.into(),
            settings,
            profiles,
            aggregation,
            fetcher,
            cache: None,
            catalog: None,
            observations: ObservationLog::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<IncrementalCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<TableCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    pub fn fetcher(&self) -> &Arc<PaginatedFetcher> {
        &self.fetcher
    }

    /// Grouped totals for `spec`, by whichever path works.
    pub async fn aggregate_query(&self, spec: &QuerySpec) -> Result<GroupedResult> {
        let profile = match self.profiles.load(&self.environment).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(
                    target: "tabula::orchestrator",
                    environment = %self.environment,
                    error = %e,
                    "[Orchestrator] Profile unreadable, aggregating without it"
                );
                None
            }
        };

        let base = self.base_plan(spec, profile.as_ref());
        let mut plan = self.resolved_plan(spec, &base);

        if profile.as_ref().is_some_and(|p| !p.supported) {
            let warning = format!(
                "server-side aggregation is marked unsupported for environment '{}'; aggregated client-side",
                self.environment
            );
            return self.fallback(spec, &base, vec![warning]).await;
        }

        let mut substituted = false;
        let mut infra_failures: u32 = 0;

        loop {
            let query = plan.query_for(spec);
            let error = match self
                .aggregation
                .run(query, self.settings.poll_interval(), self.settings.max_polls)
                .await
            {
                Ok(mut result) => {
                    result.relabel(&plan.renames());
                    result.metadata.substitutions = plan.substitutions();
                    tracing::info!(
                        target: "tabula::orchestrator",
                        table = %spec.table,
                        groups = result.rows.len(),
                        substitutions = result.metadata.substitutions.len(),
                        "[Orchestrator] Aggregated server-side"
                    );
                    return Ok(result);
                }
                Err(error) => error,
            };

            if error.is_auth_expired() {
                return Err(error);
            }

            if error.is_field_unsupported() {
                if !substituted {
                    if let Some((caller, alternative)) =
                        self.unapplied_alternative(spec, profile.as_ref(), &plan, error.unsupported_field())
                    {
                        tracing::info!(
                            target: "tabula::orchestrator",
                            field = %caller,
                            alternative = %alternative,
                            "[Orchestrator] Field rejected, retrying with profile alternative"
                        );
                        plan.queried.insert(caller, alternative);
                        substituted = true;
                        continue;
                    }
                }
                self.record(spec, ObservationKind::FieldUnsupported, &error);
                let warning = format!("aggregation rejected the query ({}); aggregated client-side", error);
                return self.fallback(spec, &base, vec![warning]).await;
            }

            if error.is_retryable() && infra_failures < self.settings.aggregation_retries {
                infra_failures += 1;
                tracing::warn!(
                    target: "tabula::orchestrator",
                    attempt = infra_failures,
                    error = %error,
                    "[Orchestrator] Aggregation failed, retrying"
                );
                continue;
            }

            self.record(spec, ObservationKind::Infrastructure, &error);
            let warning = format!(
                "aggregation failed after {} attempt(s) ({}); aggregated client-side",
                infra_failures + 1,
                error
            );
            return self.fallback(spec, &base, vec![warning]).await;
        }
    }

    /// Runs several queries concurrently (bounded), keeping input order.
    pub async fn aggregate_many(&self, specs: &[QuerySpec]) -> Result<Vec<GroupedResult>> {
        let concurrency = self.settings.aggregation_concurrency.max(1);
        stream::iter(specs)
            .map(|spec| self.aggregate_query(spec))
            .buffered(concurrency)
            .try_collect()
            .await
    }

    /// Raw rows for `table` under `filters`.
    ///
    /// With `use_cache` and no `max_rows`, rows come from an incremental
    /// cache sync; otherwise straight from the paginated fetcher.
    pub fn extract_raw<'a>(
        &'a self,
        table: &'a str,
        filters: &'a [Filter],
        max_rows: Option<u64>,
        options: ExtractOptions,
    ) -> BoxStream<'a, Result<Record>> {
        match (&self.cache, options.use_cache, max_rows) {
            (Some(cache), true, None) => stream::once(async move { cache.sync(table, filters).await })
                .map_ok(|sync| {
                    for warning in &sync.warnings {
                        tracing::warn!(target: "tabula::orchestrator", "[Orchestrator] {}", warning);
                    }
                    stream::iter(sync.records.into_iter().map(Ok))
                })
                .try_flatten()
                .boxed(),
            (None, true, None) => {
                tracing::debug!(
                    target: "tabula::orchestrator",
                    "[Orchestrator] No cache configured, fetching directly"
                );
                self.fetcher.fetch_all(table, filters, max_rows)
            }
            _ => self.fetcher.fetch_all(table, filters, max_rows),
        }
    }

    /// First rows of `table`, at most [`SAMPLE_MAX_ROWS`]. One request.
    pub async fn sample(&self, table: &str, rows: u64) -> Result<Vec<Record>> {
        let limit = rows.min(SAMPLE_MAX_ROWS);
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.fetcher.fetch_page(table, &[], 0, limit).await?.records)
    }

    /// Rows matching `filters`, at most [`FILTERED_MAX_ROWS`]. One request.
    pub async fn filtered(
        &self,
        table: &str,
        filters: &[Filter],
        limit: u64,
    ) -> Result<Vec<Record>> {
        let limit = limit.min(FILTERED_MAX_ROWS);
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.fetcher.fetch_page(table, filters, 0, limit).await?.records)
    }

    pub async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        self.catalog()?.list_tables().await
    }

    pub async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        self.catalog()?.schema(table).await
    }

    pub async fn distinct_values(
        &self,
        table: &str,
        field: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        self.catalog()?.distinct_values(table, field, limit).await
    }

    /// Hands over the compatibility observations recorded so far.
    pub fn drain_observations(&self) -> Vec<CompatibilityObservation> {
        self.observations.drain()
    }

    fn catalog(&self) -> Result<&Arc<TableCatalog>> {
        self.catalog
            .as_ref()
            .ok_or_else(|| TabulaError::config("table discovery is not configured for this engine"))
    }

    /// Caller fields mapped to deployment field names (no alternatives yet).
    fn base_plan(&self, spec: &QuerySpec, profile: Option<&CompatibilityProfile>) -> FieldPlan {
        let mut plan = FieldPlan::default();
        for field in spec.referenced_fields() {
            let actual = profile
                .and_then(|p| p.field_mappings.get(&field))
                .cloned()
                .unwrap_or_else(|| field.clone());
            plan.queried.insert(field, actual);
        }
        plan
    }

    /// Base plan with flagged fields swapped for their alternatives.
    fn resolved_plan(&self, spec: &QuerySpec, base: &FieldPlan) -> FieldPlan {
        let mut plan = base.clone();
        for field in spec.referenced_fields() {
            let actual = base.queried_name(&field);
            let semantic = self.semantic_name(&field, &actual);
            let resolved = self.profiles.resolve(&self.environment, &semantic, &actual);
            if resolved != actual {
                tracing::debug!(
                    target: "tabula::orchestrator",
                    field = %field,
                    queried = %resolved,
                    "[Orchestrator] Substituting known-failing field"
                );
            }
            plan.queried.insert(field, resolved);
        }
        plan
    }

    /// The caller's name is semantic when it was mapped; otherwise ask the profile.
    fn semantic_name(&self, caller: &str, actual: &str) -> FieldName {
        if caller != actual {
            caller.to_string()
        } else {
            self.profiles.semantic_for(&self.environment, actual)
        }
    }

    /// First field (the named one, or any when unnamed) that has an
    /// alternative not already in use.
    fn unapplied_alternative(
        &self,
        spec: &QuerySpec,
        profile: Option<&CompatibilityProfile>,
        plan: &FieldPlan,
        failing: Option<&str>,
    ) -> Option<(FieldName, FieldName)> {
        let profile = profile?;
        spec.referenced_fields().into_iter().find_map(|caller| {
            let queried = plan.queried_name(&caller);
            if let Some(failing) = failing {
                if failing != queried && failing != caller {
                    return None;
                }
            }
            let actual = self.base_actual(profile, &caller);
            let semantic = self.semantic_name(&caller, &actual);
            profile
                .alternative_for(&semantic)
                .filter(|alternative| **alternative != queried)
                .map(|alternative| (caller, alternative.clone()))
        })
    }

    fn base_actual(&self, profile: &CompatibilityProfile, caller: &str) -> FieldName {
        profile
            .field_mappings
            .get(caller)
            .cloned()
            .unwrap_or_else(|| caller.to_string())
    }

    /// Pagination plus client-side aggregation on the caller's own fields.
    async fn fallback(
        &self,
        spec: &QuerySpec,
        base: &FieldPlan,
        warnings: Vec<String>,
    ) -> Result<GroupedResult> {
        tracing::info!(
            target: "tabula::orchestrator",
            table = %spec.table,
            "[Orchestrator] Falling back to pagination"
        );
        let query = base.query_for(spec);
        let records = self.fetcher.fetch_all(&query.table, &query.filters, None);
        let mut result = aggregate_stream(records, &query.dimensions, &query.metrics).await?;

        result.relabel(&base.renames());
        result.metadata.substitutions = base.substitutions();
        result.metadata.warnings.extend(warnings);
        Ok(result)
    }

    fn record(&self, spec: &QuerySpec, kind: ObservationKind, error: &TabulaError) {
        let observation = CompatibilityObservation {
            environment: self.environment.clone(),
            table: spec.table.clone(),
            field: error.unsupported_field().map(str::to_string),
            kind,
            message: error.to_string(),
            observed_at: Utc::now(),
        };
        self.observations.push(observation);
    }
}
