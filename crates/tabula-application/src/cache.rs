//! Incremental cache of raw extractions.
//!
//! A snapshot holds every row fetched so far for one (table, filters) key,
//! in offset order. A sync probes the backend total and fetches only what
//! is new, re-validating the last cached row before trusting offsets.

use crate::fetcher::PaginatedFetcher;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tabula_core::snapshot::{CacheKey, CacheSnapshot, SnapshotRepository};
use tabula_core::{Filter, Page, Record, Result, TabulaError};
use tokio::sync::Mutex;

/// What a sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No snapshot existed; full extraction.
    Created,
    /// Backend total unchanged; snapshot returned as is.
    Unchanged,
    /// New rows appended.
    Extended { added: u64 },
    /// Snapshot discarded (shrinkage or drift) and rebuilt.
    Rebuilt,
}

/// Result of [`IncrementalCache::sync`].
#[derive(Debug, Clone)]
pub struct CacheSync {
    pub key: CacheKey,
    pub records: Vec<Record>,
    pub outcome: SyncOutcome,
    /// Recovered invalidations (`CacheShrinkage`, `CacheDrift`).
    pub warnings: Vec<TabulaError>,
    /// Backend requests issued, excluding retries.
    pub network_calls: u64,
}

pub struct IncrementalCache {
    fetcher: Arc<PaginatedFetcher>,
    repository: Arc<dyn SnapshotRepository>,
    locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl IncrementalCache {
    pub fn new(fetcher: Arc<PaginatedFetcher>, repository: Arc<dyn SnapshotRepository>) -> Self {
        Self {
            fetcher,
            repository,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    pub async fn get_snapshot(&self, key: &CacheKey) -> Result<Option<CacheSnapshot>> {
        self.repository.load(key).await
    }

    /// Appends rows that continue the snapshot.
    ///
    /// `new_last_offset` is the offset after the last new row; it must equal
    /// the snapshot's `last_offset` plus the number of new rows.
    pub async fn extend(
        &self,
        key: &CacheKey,
        new_records: Vec<Record>,
        new_last_offset: u64,
    ) -> Result<CacheSnapshot> {
        let mut snapshot = self
            .repository
            .load(key)
            .await?
            .ok_or_else(|| TabulaError::not_found("CacheSnapshot", key.to_string()))?;

        let expected = snapshot.last_offset + new_records.len() as u64;
        if new_last_offset != expected {
            return Err(TabulaError::internal(format!(
                "non-contiguous extend of {}: snapshot ends at {}, {} new rows cannot end at {}",
                key,
                snapshot.last_offset,
                new_records.len(),
                new_last_offset
            )));
        }

        snapshot.records.extend(new_records);
        snapshot.last_offset = new_last_offset;
        snapshot.total_records_last_seen = snapshot.total_records_last_seen.max(new_last_offset);
        snapshot.last_sync_time = chrono::Utc::now();
        self.repository.save(&snapshot).await?;
        Ok(snapshot)
    }

    /// True when there is no snapshot or the backend total moved (one call).
    pub async fn is_stale(&self, key: &CacheKey, filters: &[Filter]) -> Result<bool> {
        let Some(snapshot) = self.repository.load(key).await? else {
            return Ok(true);
        };
        let total = self.fetcher.count_rows(&key.table, filters).await?;
        Ok(total != snapshot.total_records_last_seen)
    }

    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        tracing::info!(target: "tabula::cache", %key, "[Cache] Snapshot invalidated");
        self.repository.delete(key).await
    }

    /// Brings the snapshot for (`table`, `filters`) up to date and returns it.
    pub async fn sync(&self, table: &str, filters: &[Filter]) -> Result<CacheSync> {
        let key = CacheKey::new(table, filters);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let snapshot = self.repository.load(&key).await?;
        let total = self.fetcher.count_rows(table, filters).await?;
        let mut network_calls = 1;
        let mut warnings = Vec::new();

        let Some(snapshot) = snapshot else {
            let (rebuilt, calls) = self.rebuild(&key, filters).await?;
            return Ok(CacheSync {
                key,
                records: rebuilt.records,
                outcome: SyncOutcome::Created,
                warnings,
                network_calls: network_calls + calls,
            });
        };

        if total == snapshot.total_records_last_seen {
            tracing::debug!(target: "tabula::cache", %key, total, "[Cache] Backend unchanged");
            return Ok(CacheSync {
                key,
                records: snapshot.records,
                outcome: SyncOutcome::Unchanged,
                warnings,
                network_calls,
            });
        }

        if total < snapshot.total_records_last_seen {
            let warning = TabulaError::CacheShrinkage {
                key: key.to_string(),
                recorded: snapshot.total_records_last_seen,
                observed: total,
            };
            tracing::warn!(target: "tabula::cache", %key, "[Cache] {}", warning);
            warnings.push(warning);
            return self.invalidate_and_rebuild(key, filters, warnings, network_calls).await;
        }

        // Grown: re-read the last cached row as a boundary check, then append.
        let start = snapshot.last_offset.saturating_sub(1);
        let pages: Vec<Page> = self
            .fetcher
            .pages(table, filters, start, None)
            .try_collect()
            .await?;
        network_calls += pages.len() as u64;
        let mut fetched = pages.into_iter().flat_map(|page| page.records);

        if snapshot.last_offset > 0 {
            let boundary = fetched.next();
            if boundary.as_ref() != snapshot.records.last() {
                let warning = TabulaError::CacheDrift {
                    key: key.to_string(),
                    offset: start,
                };
                tracing::warn!(target: "tabula::cache", %key, "[Cache] {}", warning);
                warnings.push(warning);
                return self.invalidate_and_rebuild(key, filters, warnings, network_calls).await;
            }
        }

        let new_records: Vec<Record> = fetched.collect();
        let added = new_records.len() as u64;
        let new_last_offset = snapshot.last_offset + added;
        let mut extended = self.extend(&key, new_records, new_last_offset).await?;
        if extended.total_records_last_seen != new_last_offset {
            extended.total_records_last_seen = new_last_offset;
            self.repository.save(&extended).await?;
        }
        tracing::info!(
            target: "tabula::cache",
            %key,
            added,
            last_offset = new_last_offset,
            "[Cache] Snapshot extended"
        );

        Ok(CacheSync {
            key,
            records: extended.records,
            outcome: SyncOutcome::Extended { added },
            warnings,
            network_calls,
        })
    }

    async fn invalidate_and_rebuild(
        &self,
        key: CacheKey,
        filters: &[Filter],
        warnings: Vec<TabulaError>,
        network_calls: u64,
    ) -> Result<CacheSync> {
        self.invalidate(&key).await?;
        let (rebuilt, calls) = self.rebuild(&key, filters).await?;
        Ok(CacheSync {
            key,
            records: rebuilt.records,
            outcome: SyncOutcome::Rebuilt,
            warnings,
            network_calls: network_calls + calls,
        })
    }

    /// Full extraction into a new snapshot. Returns it with the page count.
    async fn rebuild(&self, key: &CacheKey, filters: &[Filter]) -> Result<(CacheSnapshot, u64)> {
        let pages: Vec<Page> = self
            .fetcher
            .pages(&key.table, filters, 0, None)
            .try_collect()
            .await?;
        let calls = pages.len() as u64;
        let records: Vec<Record> = pages.into_iter().flat_map(|page| page.records).collect();

        // The snapshot covers exactly what was read, so a total that moved
        // during the walk shows up as growth on the next sync.
        let total = records.len() as u64;
        let snapshot = CacheSnapshot::new(key.clone(), records, total);
        self.repository.save(&snapshot).await?;
        tracing::info!(
            target: "tabula::cache",
            %key,
            rows = total,
            pages = calls,
            "[Cache] Snapshot built"
        );
        Ok((snapshot, calls))
    }
}
