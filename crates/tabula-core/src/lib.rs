//! Domain layer for Tabula.
//!
//! Holds the types every other crate agrees on (queries, records, grouped
//! results, credentials, compatibility profiles, snapshots), the shared error
//! type, and the traits at the seams to the network and to storage.

pub mod api;
pub mod catalog;
pub mod config;
pub mod credential;
pub mod error;
pub mod profile;
pub mod query;
pub mod result;
pub mod snapshot;

// Re-export common types
pub use api::{AggregateSubmission, ApiError, PollResponse, TableApi};
pub use catalog::{FieldInfo, TableInfo, TableSchema};
pub use credential::{Credential, CredentialStore, SessionCredential, TokenIssuer};
pub use error::{Result, TabulaError};
pub use profile::{
    CompatibilityObservation, CompatibilityProfile, CompatibilityProfileRepository, ProfileUpdate,
};
pub use query::{AggOp, FieldName, Filter, Metric, Page, QuerySpec, Record};
pub use result::{GroupedResult, GroupedRow, ResultMetadata, ResultSource};
pub use snapshot::{CacheKey, CacheSnapshot, SnapshotRepository};
