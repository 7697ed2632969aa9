//! Offset-indexed snapshots of previously extracted raw rows.

use crate::error::Result;
use crate::query::{Filter, Record, filter_fingerprint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one table + filter-set combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub table: String,
    pub filters: String,
}

impl CacheKey {
    pub fn new(table: impl Into<String>, filters: &[Filter]) -> Self {
        Self {
            table: table.into(),
            filters: filter_fingerprint(filters),
        }
    }

    /// Stable file-name-safe identifier (BLAKE3 over the canonical form).
    pub fn file_stem(&self) -> String {
        let hash = blake3::hash(self.to_string().as_bytes()).to_hex();
        let table: String = self
            .table
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}-{}", table, &hash.as_str()[..32])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?{}", self.table, self.filters)
    }
}

/// Durable copy of the rows fetched so far for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub key: CacheKey,
    pub total_records_last_seen: u64,
    /// Offset of the next row to fetch (equals `records.len()`).
    pub last_offset: u64,
    pub last_sync_time: DateTime<Utc>,
    pub records: Vec<Record>,
}

impl CacheSnapshot {
    pub fn new(key: CacheKey, records: Vec<Record>, total: u64) -> Self {
        Self {
            key,
            total_records_last_seen: total,
            last_offset: records.len() as u64,
            last_sync_time: Utc::now(),
            records,
        }
    }
}

/// Persistence for cache snapshots.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheSnapshot>>;
    async fn save(&self, snapshot: &CacheSnapshot) -> Result<()>;
    async fn delete(&self, key: &CacheKey) -> Result<()>;
}
