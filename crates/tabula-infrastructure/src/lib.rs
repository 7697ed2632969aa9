//! Infrastructure layer for Tabula.
//!
//! File-backed and in-memory implementations of the storage and credential
//! traits declared in `tabula-core`, plus configuration loading.

pub mod config_service;
pub mod credential_store;
pub mod json_snapshot_repository;
pub mod memory_repository;
pub mod paths;
pub mod storage;
pub mod toml_profile_repository;

pub use crate::config_service::ConfigService;
pub use crate::credential_store::{EnvCredentialStore, InMemoryCredentialStore};
pub use crate::json_snapshot_repository::JsonSnapshotRepository;
pub use crate::memory_repository::{InMemoryProfileRepository, InMemorySnapshotRepository};
pub use crate::paths::{PathError, TabulaPaths};
pub use crate::toml_profile_repository::TomlProfileRepository;
