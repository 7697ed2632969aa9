//! Configuration service implementation.
//!
//! Loads `EnvironmentsConfig` from `<config_dir>/config.toml` and caches it.
//! A missing file yields the built-in defaults; a malformed file is an error
//! rather than a silent fallback.

use crate::paths::TabulaPaths;
use crate::storage::AtomicFile;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tabula_core::config::{EnvironmentConfig, EnvironmentsConfig, ExtractionSettings};
use tabula_core::{Result, TabulaError};

/// Environment variable selecting the active environment.
pub const ENV_VAR: &str = "TABULA_ENV";

/// Loads and caches the root configuration.
#[derive(Debug, Clone)]
pub struct ConfigService {
    path: PathBuf,
    /// Cached configuration; `None` until first access or after invalidation.
    config: Arc<RwLock<Option<EnvironmentsConfig>>>,
}

impl ConfigService {
    /// Creates a service reading the default (or overridden) config file.
    pub fn new(base_path: Option<&Path>) -> Result<Self> {
        let path = TabulaPaths::new(base_path).config_file()?;
        Ok(Self::with_path(path))
    }

    /// Creates a service reading `path` (for testing).
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            config: Arc::new(RwLock::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gets the configuration, loading from file if not cached.
    pub fn get_config(&self) -> Result<EnvironmentsConfig> {
        {
            let read_lock = self
                .config
                .read()
                .map_err(|_| TabulaError::internal("config cache lock poisoned"))?;
            if let Some(ref cached) = *read_lock {
                return Ok(cached.clone());
            }
        }

        let loaded = AtomicFile::<EnvironmentsConfig>::toml(self.path.clone())
            .load()?
            .unwrap_or_default();

        tracing::debug!(
            target: "tabula::config",
            path = %self.path.display(),
            environments = loaded.environments.len(),
            "Loaded configuration"
        );

        {
            let mut write_lock = self
                .config
                .write()
                .map_err(|_| TabulaError::internal("config cache lock poisoned"))?;
            *write_lock = Some(loaded.clone());
        }

        Ok(loaded)
    }

    /// Invalidates the cache, forcing a reload on next access.
    pub fn invalidate_cache(&self) {
        if let Ok(mut write_lock) = self.config.write() {
            *write_lock = None;
        }
    }

    /// Persists `config` and refreshes the cache.
    pub fn save_config(&self, config: &EnvironmentsConfig) -> Result<()> {
        AtomicFile::toml(self.path.clone()).save(config)?;
        if let Ok(mut write_lock) = self.config.write() {
            *write_lock = Some(config.clone());
        }
        Ok(())
    }

    /// Name of the active environment.
    ///
    /// Priority: `TABULA_ENV`, the file's `active_environment`, `dev`.
    pub fn active_environment(&self) -> Result<String> {
        if let Ok(env) = std::env::var(ENV_VAR) {
            let env = env.trim();
            if !env.is_empty() {
                return Ok(env.to_string());
            }
        }
        Ok(self.get_config()?.active_environment_name().to_string())
    }

    /// Connection details for `name`.
    pub fn environment(&self, name: &str) -> Result<EnvironmentConfig> {
        Ok(self.get_config()?.environment(name))
    }

    pub fn extraction_settings(&self) -> Result<ExtractionSettings> {
        Ok(self.get_config()?.extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let service = ConfigService::new(Some(temp_dir.path())).unwrap();

        let config = service.get_config().unwrap();
        assert_eq!(config.extraction, ExtractionSettings::default());
        assert_eq!(
            service.environment("app").unwrap().base_url,
            "https://app.datarails.com"
        );
    }

    #[test]
    fn test_file_overrides_and_cache() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
active_environment = "staging"

[environments.staging]
base_url = "https://staging.example.com"
auth_url = "https://staging-auth.example.com"

[extraction]
page_size = 250
max_polls = 5
"#,
        )
        .unwrap();

        let service = ConfigService::with_path(path.clone());
        let config = service.get_config().unwrap();
        assert_eq!(config.active_environment_name(), "staging");
        assert_eq!(config.extraction.page_size, 250);
        assert_eq!(config.extraction.max_polls, 5);
        assert_eq!(config.extraction.refresh_every_rows, 20_000);

        // Cached until invalidated
        std::fs::write(&path, "[extraction]\npage_size = 100\n").unwrap();
        assert_eq!(service.get_config().unwrap().extraction.page_size, 250);
        service.invalidate_cache();
        assert_eq!(service.get_config().unwrap().extraction.page_size, 100);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[extraction\npage_size = ").unwrap();

        let service = ConfigService::with_path(path);
        assert!(service.get_config().is_err());
    }

    #[test]
    fn test_save_config_updates_cache() {
        let temp_dir = TempDir::new().unwrap();
        let service = ConfigService::new(Some(temp_dir.path())).unwrap();

        let mut config = service.get_config().unwrap();
        config.active_environment = Some("demo".into());
        service.save_config(&config).unwrap();

        service.invalidate_cache();
        assert_eq!(
            service.get_config().unwrap().active_environment.as_deref(),
            Some("demo")
        );
    }
}
