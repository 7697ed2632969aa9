//! JSON-based SnapshotRepository implementation.

use crate::paths::TabulaPaths;
use crate::storage::{AtomicFile, run_blocking};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tabula_core::snapshot::{CacheKey, CacheSnapshot, SnapshotRepository};
use tabula_core::{Result, TabulaError};

/// Stores one snapshot per cache key as
/// `<cache_dir>/snapshots/<environment>/<key-stem>.json`.
///
/// Snapshots are scoped to an environment because offsets are only
/// meaningful against the deployment they were fetched from.
#[derive(Debug, Clone)]
pub struct JsonSnapshotRepository {
    dir: PathBuf,
}

impl JsonSnapshotRepository {
    pub fn new(base_path: Option<&Path>, environment: &str) -> Result<Self> {
        let dir = TabulaPaths::new(base_path).snapshots_dir(environment)?;
        Ok(Self { dir })
    }

    /// Uses `dir` directly as the snapshot directory.
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn file_for(&self, key: &CacheKey) -> AtomicFile<CacheSnapshot> {
        AtomicFile::json(self.dir.join(format!("{}.json", key.file_stem())))
    }
}

#[async_trait]
impl SnapshotRepository for JsonSnapshotRepository {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheSnapshot>> {
        let file = self.file_for(key);
        let expected = key.clone();
        let snapshot = run_blocking(move || Ok(file.load()?)).await?;

        match snapshot {
            // Stem collision or a hand-copied file: treat as a miss.
            Some(snapshot) if snapshot.key != expected => {
                tracing::warn!(
                    target: "tabula::cache",
                    key = %expected,
                    stored = %snapshot.key,
                    "Snapshot key mismatch; ignoring stored snapshot"
                );
                Ok(None)
            }
            Some(snapshot) if snapshot.last_offset != snapshot.records.len() as u64 => {
                Err(TabulaError::Serialization {
                    format: "JSON".to_string(),
                    message: format!(
                        "snapshot {} claims offset {} but holds {} rows",
                        expected,
                        snapshot.last_offset,
                        snapshot.records.len()
                    ),
                })
            }
            other => Ok(other),
        }
    }

    async fn save(&self, snapshot: &CacheSnapshot) -> Result<()> {
        let file = self.file_for(&snapshot.key);
        let snapshot = snapshot.clone();
        run_blocking(move || Ok(file.save(&snapshot)?)).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        let file = self.file_for(key);
        run_blocking(move || Ok(file.remove()?)).await
    }
}
