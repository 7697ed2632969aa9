//! Unified path management for Tabula files.
//!
//! # Directory Structure
//!
//! ```text
//! ~/.config/tabula/            # Config directory (TABULA_CONFIG_DIR overrides)
//! ├── config.toml              # Environments + extraction settings
//! └── profiles/                # Compatibility profiles, one per environment
//!     ├── app.toml
//!     └── dev.toml
//!
//! ~/.cache/tabula/             # Cache directory
//! └── snapshots/               # Incremental cache snapshots
//!     └── app/
//!         └── 16528-<hash>.json
//! ```
//!
//! Passing a base directory (tests, portable installs) puts both trees under it.

use std::path::{Path, PathBuf};

/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "TABULA_CONFIG_DIR";

const APP_DIR: &str = "tabula";

/// Errors that can occur during path resolution.
#[derive(Debug)]
pub enum PathError {
    /// Home directory could not be determined.
    HomeDirNotFound,
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::HomeDirNotFound => write!(f, "Cannot find home directory"),
        }
    }
}

impl std::error::Error for PathError {}

impl From<PathError> for tabula_core::TabulaError {
    fn from(e: PathError) -> Self {
        tabula_core::TabulaError::config(e.to_string())
    }
}

/// Resolves every file location used by the engine.
#[derive(Debug, Clone, Default)]
pub struct TabulaPaths {
    base: Option<PathBuf>,
}

impl TabulaPaths {
    /// Creates a resolver. `None` uses the platform directories.
    pub fn new(base: Option<&Path>) -> Self {
        Self {
            base: base.map(Path::to_path_buf),
        }
    }

    /// Returns the configuration directory.
    ///
    /// Priority: explicit base, `TABULA_CONFIG_DIR`, platform config dir.
    pub fn config_dir(&self) -> Result<PathBuf, PathError> {
        if let Some(base) = &self.base {
            return Ok(base.join("config"));
        }
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            if !dir.trim().is_empty() {
                return Ok(PathBuf::from(dir));
            }
        }
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or(PathError::HomeDirNotFound)
    }

    /// Returns the cache directory.
    pub fn cache_dir(&self) -> Result<PathBuf, PathError> {
        if let Some(base) = &self.base {
            return Ok(base.join("cache"));
        }
        dirs::cache_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or(PathError::HomeDirNotFound)
    }

    pub fn config_file(&self) -> Result<PathBuf, PathError> {
        Ok(self.config_dir()?.join("config.toml"))
    }

    pub fn profiles_dir(&self) -> Result<PathBuf, PathError> {
        Ok(self.config_dir()?.join("profiles"))
    }

    /// Profile file for one environment.
    pub fn profile_file(&self, environment: &str) -> Result<PathBuf, PathError> {
        Ok(self
            .profiles_dir()?
            .join(format!("{}.toml", sanitize(environment))))
    }

    /// Snapshot directory for one environment.
    pub fn snapshots_dir(&self, environment: &str) -> Result<PathBuf, PathError> {
        Ok(self.cache_dir()?.join("snapshots").join(sanitize(environment)))
    }
}

/// Keeps environment names from escaping their directory.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
