//! In-memory repositories, for tests and for runs with persistence disabled.

use async_trait::async_trait;
use std::collections::HashMap;
use tabula_core::Result;
use tabula_core::profile::{CompatibilityProfile, CompatibilityProfileRepository, ProfileUpdate};
use tabula_core::snapshot::{CacheKey, CacheSnapshot, SnapshotRepository};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryProfileRepository {
    profiles: RwLock<HashMap<String, CompatibilityProfile>>,
}

impl InMemoryProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(profile: CompatibilityProfile) -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(profile.environment.clone(), profile);
        Self {
            profiles: RwLock::new(profiles),
        }
    }
}

#[async_trait]
impl CompatibilityProfileRepository for InMemoryProfileRepository {
    async fn load(&self, environment: &str) -> Result<Option<CompatibilityProfile>> {
        Ok(self.profiles.read().await.get(environment).cloned())
    }

    async fn save(&self, environment: &str, profile: &CompatibilityProfile) -> Result<()> {
        self.profiles
            .write()
            .await
            .insert(environment.to_string(), profile.clone());
        Ok(())
    }

    async fn delete(&self, environment: &str) -> Result<()> {
        self.profiles.write().await.remove(environment);
        Ok(())
    }

    async fn update(
        &self,
        environment: &str,
        apply: ProfileUpdate,
    ) -> Result<(CompatibilityProfile, usize)> {
        let mut profiles = self.profiles.write().await;
        let mut profile = profiles
            .get(environment)
            .cloned()
            .unwrap_or_else(|| CompatibilityProfile::new(environment));
        let changes = apply(&mut profile);
        if changes > 0 {
            profiles.insert(environment.to_string(), profile.clone());
        }
        Ok((profile, changes))
    }
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotRepository {
    snapshots: RwLock<HashMap<CacheKey, CacheSnapshot>>,
}

impl InMemorySnapshotRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl SnapshotRepository for InMemorySnapshotRepository {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheSnapshot>> {
        Ok(self.snapshots.read().await.get(key).cloned())
    }

    async fn save(&self, snapshot: &CacheSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.key.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.snapshots.write().await.remove(key);
        Ok(())
    }
}
