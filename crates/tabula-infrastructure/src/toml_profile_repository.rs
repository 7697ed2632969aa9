//! TOML-based CompatibilityProfileRepository implementation.
//!
//! One file per environment under `<config_dir>/profiles/`. Files are small
//! and meant to be hand-correctable after a bad probe.

use crate::paths::TabulaPaths;
use crate::storage::{AtomicFile, run_blocking};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tabula_core::profile::{CompatibilityProfile, CompatibilityProfileRepository, ProfileUpdate};
use tabula_core::Result;

/// Stores compatibility profiles as `<profiles_dir>/<environment>.toml`.
///
/// Responsibilities:
/// - Resolve the per-environment file path
/// - Load/save through [`AtomicFile`] on the blocking pool
/// - Serialize read-modify-write updates across processes with a file lock
///
/// Does NOT:
/// - Cache profiles (the application layer's `ProfileStore` does)
/// - Decide when a profile is stale
#[derive(Debug, Clone)]
pub struct TomlProfileRepository {
    paths: TabulaPaths,
}

impl TomlProfileRepository {
    /// Creates a repository rooted at the default (or overridden) config directory.
    pub fn new(base_path: Option<&Path>) -> Self {
        Self {
            paths: TabulaPaths::new(base_path),
        }
    }

    fn file_for(&self, environment: &str) -> Result<AtomicFile<CompatibilityProfile>> {
        let path: PathBuf = self.paths.profile_file(environment)?;
        Ok(AtomicFile::toml(path))
    }
}

#[async_trait]
impl CompatibilityProfileRepository for TomlProfileRepository {
    async fn load(&self, environment: &str) -> Result<Option<CompatibilityProfile>> {
        let file = self.file_for(environment)?;
        let environment = environment.to_string();
        run_blocking(move || {
            let profile = file.load()?;
            if let Some(profile) = &profile {
                if profile.environment != environment {
                    tracing::warn!(
                        target: "tabula::profile",
                        file_environment = %profile.environment,
                        requested = %environment,
                        "Profile file records a different environment"
                    );
                }
            }
            Ok(profile)
        })
        .await
    }

    async fn save(&self, environment: &str, profile: &CompatibilityProfile) -> Result<()> {
        let file = self.file_for(environment)?;
        let profile = profile.clone();
        run_blocking(move || Ok(file.save(&profile)?)).await?;
        tracing::debug!(target: "tabula::profile", environment, "Saved compatibility profile");
        Ok(())
    }

    async fn delete(&self, environment: &str) -> Result<()> {
        let file = self.file_for(environment)?;
        run_blocking(move || Ok(file.remove()?)).await
    }

    async fn update(
        &self,
        environment: &str,
        apply: ProfileUpdate,
    ) -> Result<(CompatibilityProfile, usize)> {
        let file = self.file_for(environment)?;
        let empty = CompatibilityProfile::new(environment);
        let (profile, changes) = run_blocking(move || {
            let mut changes = 0;
            let profile = file.update(empty, |profile| {
                changes = apply(profile);
                Ok(changes > 0)
            })?;
            Ok((profile, changes))
        })
        .await?;
        tracing::debug!(target: "tabula::profile", environment, changes, "Updated compatibility profile");
        Ok((profile, changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::TabulaError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_profile() {
        let temp_dir = TempDir::new().unwrap();
        let repo = TomlProfileRepository::new(Some(temp_dir.path()));
        assert!(repo.load("app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let temp_dir = TempDir::new().unwrap();
        let repo = TomlProfileRepository::new(Some(temp_dir.path()));

        let mut profile = CompatibilityProfile::new("app");
        profile.failed_fields.insert("AccountL1".into());
        profile
            .field_alternatives
            .insert("AccountL1".into(), "AccountL1_5".into());
        repo.save("app", &profile).await.unwrap();

        let loaded = repo.load("app").await.unwrap().unwrap();
        assert_eq!(loaded.resolve("AccountL1", "AccountL1"), "AccountL1_5");
        assert!(repo.load("dev").await.unwrap().is_none());

        repo.delete("app").await.unwrap();
        assert!(repo.load("app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_creates_then_merges() {
        let temp_dir = TempDir::new().unwrap();
        let repo = TomlProfileRepository::new(Some(temp_dir.path()));

        let (created, changes) = repo
            .update(
                "app",
                Box::new(|profile: &mut CompatibilityProfile| {
                    usize::from(profile.failed_fields.insert("DR_ACC_L2".into()))
                }),
            )
            .await
            .unwrap();
        assert_eq!(changes, 1);
        assert_eq!(created.environment, "app");

        let (merged, changes) = repo
            .update(
                "app",
                Box::new(|profile: &mut CompatibilityProfile| {
                    usize::from(profile.failed_fields.insert("AccountL1".into()))
                }),
            )
            .await
            .unwrap();
        assert_eq!(changes, 1);
        assert_eq!(merged.failed_fields.len(), 2);

        let loaded = repo.load("app").await.unwrap().unwrap();
        assert!(loaded.failed_fields.contains("DR_ACC_L2"));
        assert!(loaded.failed_fields.contains("AccountL1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_keep_every_field() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().to_path_buf();

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                // Separate repositories stand in for separate processes.
                let repo = TomlProfileRepository::new(Some(&base));
                tokio::spawn(async move {
                    repo.update(
                        "app",
                        Box::new(move |profile: &mut CompatibilityProfile| {
                            usize::from(profile.failed_fields.insert(format!("Field{}", i)))
                        }),
                    )
                    .await
                    .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let repo = TomlProfileRepository::new(Some(&base));
        let loaded = repo.load("app").await.unwrap().unwrap();
        assert_eq!(loaded.failed_fields.len(), 6);
    }

    #[tokio::test]
    async fn test_corrupt_profile_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let paths = TabulaPaths::new(Some(temp_dir.path()));
        let path = paths.profile_file("app").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "supported = \"maybe\"").unwrap();

        let repo = TomlProfileRepository::new(Some(temp_dir.path()));
        let err = repo.load("app").await.unwrap_err();
        assert!(matches!(err, TabulaError::Serialization { .. }));
    }
}
