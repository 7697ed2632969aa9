//! Compatibility profile domain model.
//!
//! A profile records, per environment, which fields the aggregation endpoint
//! accepts and which alternative fields can stand in for the ones it rejects.

use crate::error::Result;
use crate::query::FieldName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-environment knowledge of server-side aggregation support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityProfile {
    pub environment: String,
    /// Whether the aggregation endpoint works at all in this environment.
    pub supported: bool,
    #[serde(default)]
    pub failed_fields: BTreeSet<FieldName>,
    /// Semantic field to the alternative field that aggregates correctly.
    #[serde(default)]
    pub field_alternatives: BTreeMap<FieldName, FieldName>,
    /// Semantic field to the actual field name used by this deployment.
    #[serde(default)]
    pub field_mappings: BTreeMap<FieldName, FieldName>,
    pub tested_at: DateTime<Utc>,
}

impl CompatibilityProfile {
    /// An empty profile: nothing known to fail, nothing mapped.
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            supported: true,
            failed_fields: BTreeSet::new(),
            field_alternatives: BTreeMap::new(),
            field_mappings: BTreeMap::new(),
            tested_at: Utc::now(),
        }
    }

    /// Returns the alternative for `actual_field` when it is known to fail and
    /// an alternative exists for `semantic_field`; otherwise `actual_field`.
    pub fn resolve(&self, semantic_field: &str, actual_field: &str) -> FieldName {
        if self.failed_fields.contains(actual_field) {
            if let Some(alternative) = self.field_alternatives.get(semantic_field) {
                return alternative.clone();
            }
        }
        actual_field.to_string()
    }

    /// Alternative for a field regardless of whether it is flagged failed.
    pub fn alternative_for(&self, semantic_field: &str) -> Option<&FieldName> {
        self.field_alternatives.get(semantic_field)
    }

    /// Maps an actual field back to its semantic name (identity when unmapped).
    pub fn semantic_for(&self, actual_field: &str) -> FieldName {
        self.field_mappings
            .iter()
            .find(|(_, actual)| actual.as_str() == actual_field)
            .map(|(semantic, _)| semantic.clone())
            .unwrap_or_else(|| actual_field.to_string())
    }

    /// True when the profile is older than `max_age`.
    pub fn is_expired(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.tested_at > max_age
    }
}

/// What the orchestrator saw at runtime, for the prober to fold in later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityObservation {
    pub environment: String,
    pub table: String,
    /// The field the backend named in its failure, when it named one.
    pub field: Option<FieldName>,
    pub kind: ObservationKind,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    /// Aggregation rejected a field and no alternative rescued the query.
    FieldUnsupported,
    /// Aggregation kept failing for infrastructure reasons.
    Infrastructure,
}

/// Read-modify-write step for [`CompatibilityProfileRepository::update`].
///
/// Returns the number of changes it made; zero leaves storage untouched.
pub type ProfileUpdate = Box<dyn FnOnce(&mut CompatibilityProfile) -> usize + Send>;

/// Persistence for compatibility profiles.
#[async_trait]
pub trait CompatibilityProfileRepository: Send + Sync {
    /// Loads the profile for `environment`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(profile))`: Profile found
    /// - `Ok(None)`: No profile has been recorded
    /// - `Err(_)`: Storage failure
    async fn load(&self, environment: &str) -> Result<Option<CompatibilityProfile>>;

    /// Saves (replaces) the profile for `environment`.
    async fn save(&self, environment: &str, profile: &CompatibilityProfile) -> Result<()>;

    /// Deletes the profile for `environment` (no-op when absent).
    async fn delete(&self, environment: &str) -> Result<()>;

    /// Applies `apply` to the stored profile (an empty one when absent) and
    /// writes it back when `apply` reports changes.
    ///
    /// Concurrent updates of one environment, including from other
    /// processes sharing the storage, are serialized so none is lost.
    /// Returns the resulting profile and the change count.
    async fn update(
        &self,
        environment: &str,
        apply: ProfileUpdate,
    ) -> Result<(CompatibilityProfile, usize)>;
}
