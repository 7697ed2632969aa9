//! Environment and extraction configuration.
//!
//! These types are plain serde models. Loading them from disk is the job of
//! `tabula_infrastructure::ConfigService`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Environment used when neither the config file nor `TABULA_ENV` selects one.
pub const DEFAULT_ENV: &str = "dev";

/// Maximum number of rows the raw-record endpoint returns per page.
pub const MAX_PAGE_SIZE: u64 = 500;

/// Connection details for one deployment of the finance API.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub base_url: String,
    pub auth_url: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl EnvironmentConfig {
    /// Builds the conventional `https://{name}.datarails.com` pair for an environment.
    pub fn conventional(name: &str) -> Self {
        Self {
            base_url: format!("https://{}.datarails.com", name),
            auth_url: format!("https://{}-auth.datarails.com", name),
            display_name: None,
        }
    }

    /// Root of the table API for this environment.
    pub fn api_root(&self) -> String {
        format!("{}/finance-os/api", self.base_url.trim_end_matches('/'))
    }
}

/// Root of `config.toml`.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct EnvironmentsConfig {
    #[serde(default)]
    pub active_environment: Option<String>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub extraction: ExtractionSettings,
}

impl EnvironmentsConfig {
    /// Built-in environments, overridden entry by entry by the config file.
    pub fn builtin_environments() -> BTreeMap<String, EnvironmentConfig> {
        let entries = [
            ("dev", "https://dev.datarails.com", "https://dev-auth.datarails.com", "Development"),
            ("demo", "https://demo.datarails.com", "https://demo-auth.datarails.com", "Demo"),
            (
                "testapp",
                "https://testapp.datarails.com",
                "https://testapp-auth.datarails.com",
                "Test App",
            ),
            ("app", "https://app.datarails.com", "https://auth.datarails.com", "Production"),
        ];

        entries
            .into_iter()
            .map(|(name, base_url, auth_url, display_name)| {
                (
                    name.to_string(),
                    EnvironmentConfig {
                        base_url: base_url.to_string(),
                        auth_url: auth_url.to_string(),
                        display_name: Some(display_name.to_string()),
                    },
                )
            })
            .collect()
    }

    /// Returns all environments: built-ins merged with the configured ones.
    pub fn merged_environments(&self) -> BTreeMap<String, EnvironmentConfig> {
        let mut merged = Self::builtin_environments();
        merged.extend(self.environments.clone());
        merged
    }

    /// Looks up an environment, falling back to the conventional URL scheme.
    pub fn environment(&self, name: &str) -> EnvironmentConfig {
        self.merged_environments()
            .remove(name)
            .unwrap_or_else(|| EnvironmentConfig::conventional(name))
    }

    /// Name of the active environment recorded in the file (or the default).
    pub fn active_environment_name(&self) -> &str {
        self.active_environment.as_deref().unwrap_or(DEFAULT_ENV)
    }
}

/// Tunables for token refresh, pagination, polling and concurrency.
///
/// Durations are stored as integers so the TOML stays hand-editable.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Rows per page requested from the raw-record endpoint (capped at 500).
    pub page_size: u64,
    /// Proactive token refresh cadence during pagination (0 disables it).
    pub refresh_every_rows: u64,
    /// Retries per page for transient (5xx/network) failures.
    pub page_retry_attempts: u32,
    pub page_retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    /// Extra aggregation attempts after an infrastructure failure.
    pub aggregation_retries: u32,
    pub aggregation_concurrency: usize,
    pub token_safety_margin_secs: u64,
    pub request_timeout_secs: u64,
    /// Profiles older than this are ignored. Zero disables the age check.
    pub profile_max_age_days: u64,
    /// How long a loaded profile is reused before the file is read again.
    pub profile_refresh_secs: u64,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            refresh_every_rows: 20_000,
            page_retry_attempts: 3,
            page_retry_backoff_ms: 500,
            poll_interval_ms: 2_000,
            max_polls: 30,
            aggregation_retries: 2,
            aggregation_concurrency: 4,
            token_safety_margin_secs: 30,
            request_timeout_secs: 60,
            profile_max_age_days: 30,
            profile_refresh_secs: 60,
        }
    }
}

impl ExtractionSettings {
    /// Page size clamped to the backend maximum (and at least one row).
    pub fn effective_page_size(&self) -> u64 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn page_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.page_retry_backoff_ms)
    }

    pub fn token_safety_margin(&self) -> Duration {
        Duration::from_secs(self.token_safety_margin_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn profile_max_age(&self) -> Option<chrono::Duration> {
        if self.profile_max_age_days == 0 {
            None
        } else {
            Some(chrono::Duration::days(self.profile_max_age_days as i64))
        }
    }

    pub fn profile_refresh(&self) -> Duration {
        Duration::from_secs(self.profile_refresh_secs)
    }
}
