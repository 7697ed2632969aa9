//! Builds compatibility profiles by probing the aggregation endpoint.

use crate::aggregation::AggregationClient;
use crate::profile_store::ProfileStore;
use chrono::Utc;
use std::time::Duration;
use tabula_core::profile::{CompatibilityObservation, CompatibilityProfile, ObservationKind};
use tabula_core::{FieldName, Metric, QuerySpec, Result, TableSchema};

/// One field to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCandidate {
    /// Name callers use for the field.
    pub semantic: FieldName,
    /// Column name in this deployment.
    pub actual: FieldName,
    /// Fields to try, in order, when `actual` does not aggregate.
    pub alternatives: Vec<FieldName>,
}

impl ProbeCandidate {
    pub fn new(field: impl Into<FieldName>) -> Self {
        let field = field.into();
        Self {
            semantic: field.clone(),
            actual: field,
            alternatives: Vec::new(),
        }
    }

    pub fn mapped_to(mut self, actual: impl Into<FieldName>) -> Self {
        self.actual = actual.into();
        self
    }

    pub fn with_alternative(mut self, alternative: impl Into<FieldName>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// One candidate per non-numeric column of `schema`.
    pub fn from_schema(schema: &TableSchema) -> Vec<Self> {
        schema
            .dimension_fields()
            .map(|field| Self::new(field.name.clone()))
            .collect()
    }
}

pub struct CompatibilityProber {
    aggregation: AggregationClient,
    environment: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl CompatibilityProber {
    pub fn new(
        aggregation: AggregationClient,
        environment: impl Into<String>,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Self {
        Self {
            aggregation,
            environment: environment.into(),
            poll_interval,
            max_polls,
        }
    }

    /// Probes every candidate with a one-dimension aggregation of `metric`.
    ///
    /// Authentication failures abort the probe; every other failure marks the
    /// trial field as failed.
    pub async fn probe(
        &self,
        table: &str,
        candidates: &[ProbeCandidate],
        metric: &Metric,
    ) -> Result<CompatibilityProfile> {
        let mut profile = CompatibilityProfile::new(&self.environment);
        let mut any_passed = false;

        for candidate in candidates {
            if candidate.actual != candidate.semantic {
                profile
                    .field_mappings
                    .insert(candidate.semantic.clone(), candidate.actual.clone());
            }

            if self.trial(table, &candidate.actual, metric).await? {
                any_passed = true;
                continue;
            }
            profile.failed_fields.insert(candidate.actual.clone());

            for alternative in &candidate.alternatives {
                if self.trial(table, alternative, metric).await? {
                    tracing::info!(
                        target: "tabula::prober",
                        field = %candidate.semantic,
                        alternative = %alternative,
                        "[Prober] Alternative aggregates"
                    );
                    profile
                        .field_alternatives
                        .insert(candidate.semantic.clone(), alternative.clone());
                    any_passed = true;
                    break;
                }
            }
        }

        profile.supported = any_passed;
        profile.tested_at = Utc::now();
        tracing::info!(
            target: "tabula::prober",
            environment = %self.environment,
            supported = profile.supported,
            failed = profile.failed_fields.len(),
            alternatives = profile.field_alternatives.len(),
            "[Prober] Probe finished"
        );
        Ok(profile)
    }

    /// Probes and persists the profile through `store`.
    pub async fn probe_and_save(
        &self,
        store: &ProfileStore,
        table: &str,
        candidates: &[ProbeCandidate],
        metric: &Metric,
    ) -> Result<CompatibilityProfile> {
        let profile = self.probe(table, candidates, metric).await?;
        store.save(&self.environment, &profile).await?;
        Ok(profile)
    }

    async fn trial(&self, table: &str, field: &str, metric: &Metric) -> Result<bool> {
        let query = QuerySpec::new(table).group_by(field).metric(metric.clone());
        match self
            .aggregation
            .run(query, self.poll_interval, self.max_polls)
            .await
        {
            Ok(_) => {
                tracing::debug!(target: "tabula::prober", field, "[Prober] Field aggregates");
                Ok(true)
            }
            Err(e) if e.is_auth_expired() => Err(e),
            Err(e) => {
                tracing::info!(
                    target: "tabula::prober",
                    field,
                    error = %e,
                    "[Prober] Field does not aggregate"
                );
                Ok(false)
            }
        }
    }
}

/// Folds orchestrator observations into `profile`. Returns how many fields
/// were newly flagged.
///
/// Only named field rejections change the profile; infrastructure failures
/// say nothing about a field. `tested_at` is left alone: it dates the last
/// trial run.
pub fn apply_observations(
    profile: &mut CompatibilityProfile,
    observations: &[CompatibilityObservation],
) -> usize {
    let mut flagged = 0;
    for observation in observations {
        if observation.environment != profile.environment {
            continue;
        }
        if let (ObservationKind::FieldUnsupported, Some(field)) =
            (&observation.kind, &observation.field)
        {
            if profile.failed_fields.insert(field.clone()) {
                flagged += 1;
            }
        }
    }
    flagged
}
