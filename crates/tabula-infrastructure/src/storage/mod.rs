//! Storage layer for atomic file operations.

mod atomic_file;

pub use atomic_file::{AtomicFile, AtomicFileError, FileFormat};

use tabula_core::{Result, TabulaError};

/// Runs blocking file work on tokio's blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TabulaError::internal(format!("Blocking task failed: {}", e)))?
}
