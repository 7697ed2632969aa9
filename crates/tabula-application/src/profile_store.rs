//! In-memory view of compatibility profiles over a repository.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tabula_core::profile::{CompatibilityProfile, CompatibilityProfileRepository};
use tabula_core::{FieldName, Result};
use tokio::time::Instant;

/// How long a loaded profile is trusted before storage is read again.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// A profile as last read from storage.
#[derive(Debug, Clone)]
struct Loaded {
    /// `None` records "looked up, nothing usable".
    profile: Option<CompatibilityProfile>,
    read_at: Instant,
}

/// Injected profile holder.
///
/// `load` and `save` go through the repository; `resolve` and `semantic_for`
/// only read what was loaded, so they never block on I/O.
///
/// `load` re-reads storage once the copy in memory is older than the refresh
/// interval, so profiles written by a separate probing run are picked up, and
/// re-checks the age limit on every call.
pub struct ProfileStore {
    repository: Arc<dyn CompatibilityProfileRepository>,
    max_age: Option<chrono::Duration>,
    refresh_interval: Duration,
    loaded: RwLock<HashMap<String, Loaded>>,
}

impl ProfileStore {
    pub fn new(repository: Arc<dyn CompatibilityProfileRepository>) -> Self {
        Self {
            repository,
            max_age: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// Profiles older than `max_age` are treated as absent.
    pub fn with_max_age(mut self, max_age: Option<chrono::Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// How long a loaded profile is reused before storage is read again.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Returns the usable profile for `environment`.
    pub async fn load(&self, environment: &str) -> Result<Option<CompatibilityProfile>> {
        if let Some(loaded) = self.cached(environment) {
            if loaded.read_at.elapsed() < self.refresh_interval {
                return Ok(match loaded.profile {
                    Some(profile) if self.is_expired(&profile) => {
                        self.log_expired(environment, &profile);
                        self.remember(environment, None, loaded.read_at);
                        None
                    }
                    profile => profile,
                });
            }
        }

        let profile = match self.repository.load(environment).await? {
            Some(profile) if self.is_expired(&profile) => {
                self.log_expired(environment, &profile);
                None
            }
            profile => profile,
        };
        self.remember(environment, profile.clone(), Instant::now());
        Ok(profile)
    }

    pub async fn save(&self, environment: &str, profile: &CompatibilityProfile) -> Result<()> {
        self.repository.save(environment, profile).await?;
        self.remember(environment, Some(profile.clone()), Instant::now());
        tracing::info!(
            target: "tabula::profile",
            environment,
            failed_fields = profile.failed_fields.len(),
            alternatives = profile.field_alternatives.len(),
            "[ProfileStore] Profile saved"
        );
        Ok(())
    }

    /// Locked read-modify-write of the stored profile.
    ///
    /// An expired profile is replaced by an empty one before `apply` runs.
    /// Returns the number of changes `apply` reported.
    pub async fn update<F>(&self, environment: &str, apply: F) -> Result<usize>
    where
        F: FnOnce(&mut CompatibilityProfile) -> usize + Send + 'static,
    {
        let max_age = self.max_age;
        let env = environment.to_string();
        let (profile, changes) = self
            .repository
            .update(
                environment,
                Box::new(move |profile: &mut CompatibilityProfile| {
                    let expired = max_age.is_some_and(|age| profile.is_expired(age, Utc::now()));
                    if expired {
                        *profile = CompatibilityProfile::new(env);
                    }
                    apply(profile)
                }),
            )
            .await?;

        if changes > 0 {
            tracing::info!(
                target: "tabula::profile",
                environment,
                changes,
                failed_fields = profile.failed_fields.len(),
                "[ProfileStore] Profile updated"
            );
            self.remember(environment, Some(profile), Instant::now());
        }
        Ok(changes)
    }

    /// Deletes the stored profile.
    pub async fn invalidate(&self, environment: &str) -> Result<()> {
        self.repository.delete(environment).await?;
        self.remember(environment, None, Instant::now());
        Ok(())
    }

    /// Forgets the in-memory copy so the next `load` reads storage again.
    pub fn reload(&self, environment: &str) {
        if let Ok(mut loaded) = self.loaded.write() {
            loaded.remove(environment);
        }
    }

    /// Field to query for `actual_field`. Identity without a loaded profile.
    pub fn resolve(&self, environment: &str, semantic_field: &str, actual_field: &str) -> FieldName {
        self.with_profile(environment, |profile| profile.resolve(semantic_field, actual_field))
            .unwrap_or_else(|| actual_field.to_string())
    }

    /// Semantic name for `actual_field`. Identity without a loaded profile.
    pub fn semantic_for(&self, environment: &str, actual_field: &str) -> FieldName {
        self.with_profile(environment, |profile| profile.semantic_for(actual_field))
            .unwrap_or_else(|| actual_field.to_string())
    }

    fn is_expired(&self, profile: &CompatibilityProfile) -> bool {
        self.max_age
            .is_some_and(|max_age| profile.is_expired(max_age, Utc::now()))
    }

    fn log_expired(&self, environment: &str, profile: &CompatibilityProfile) {
        tracing::info!(
            target: "tabula::profile",
            environment,
            tested_at = %profile.tested_at,
            "[ProfileStore] Profile expired, ignoring it"
        );
    }

    fn remember(&self, environment: &str, profile: Option<CompatibilityProfile>, read_at: Instant) {
        if let Ok(mut loaded) = self.loaded.write() {
            loaded.insert(environment.to_string(), Loaded { profile, read_at });
        }
    }

    fn cached(&self, environment: &str) -> Option<Loaded> {
        self.loaded.read().ok()?.get(environment).cloned()
    }

    fn with_profile<T>(&self, environment: &str, f: impl FnOnce(&CompatibilityProfile) -> T) -> Option<T> {
        let loaded = self.loaded.read().ok()?;
        let profile = loaded.get(environment)?.profile.as_ref()?;
        if self.is_expired(profile) {
            return None;
        }
        Some(f(profile))
    }
}
