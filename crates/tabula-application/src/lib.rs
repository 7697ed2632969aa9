//! Application layer for Tabula.
//!
//! Coordinates the transport and storage seams defined in `tabula-core` into
//! the extraction engine: token lifecycle, aggregation with polling,
//! pagination, client-side reduction, incremental caching, and the
//! orchestrator that chooses between them.

mod call;

pub mod aggregation;
pub mod cache;
pub mod catalog;
pub mod client_aggregator;
pub mod fetcher;
pub mod orchestrator;
pub mod profile_store;
pub mod prober;
pub mod token_manager;

pub use aggregation::{AggregationClient, AggregationTask, TaskState};
pub use cache::{CacheSync, IncrementalCache, SyncOutcome};
pub use catalog::{DEFAULT_DISTINCT_LIMIT, TableCatalog};
pub use client_aggregator::ClientAggregator;
pub use fetcher::{FetchSettings, PaginatedFetcher};
pub use orchestrator::{
    ExtractOptions, ExtractionOrchestrator, FILTERED_MAX_ROWS, SAMPLE_MAX_ROWS,
};
pub use prober::{CompatibilityProber, ProbeCandidate, apply_observations};
pub use profile_store::{DEFAULT_REFRESH_INTERVAL, ProfileStore};
pub use token_manager::{TokenInfo, TokenManager};
