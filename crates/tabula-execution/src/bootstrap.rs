//! Wires configuration, credentials, transport and storage into an engine.

use anyhow::{Result, anyhow};
use std::path::PathBuf;
use std::sync::Arc;
use tabula_application::{
    AggregationClient, CompatibilityProber, ExtractionOrchestrator, FetchSettings,
    IncrementalCache, PaginatedFetcher, ProfileStore, TableCatalog, TokenManager,
    apply_observations,
};
use tabula_core::config::ExtractionSettings;
use tabula_core::{CredentialStore, TableApi, TokenIssuer};
use tabula_infrastructure::{
    ConfigService, EnvCredentialStore, JsonSnapshotRepository, TomlProfileRepository,
};
use tabula_interaction::{HttpTableApi, HttpTokenIssuer};

/// Where to read configuration and which environment to target.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Overrides the config/cache base directory.
    pub base_path: Option<PathBuf>,
    /// Overrides `TABULA_ENV` and the configured active environment.
    pub environment: Option<String>,
}

/// A fully wired engine for one environment.
pub struct ExtractionEngine {
    pub environment: String,
    pub settings: ExtractionSettings,
    pub tokens: Arc<TokenManager>,
    pub profiles: Arc<ProfileStore>,
    pub fetcher: Arc<PaginatedFetcher>,
    pub cache: Arc<IncrementalCache>,
    pub catalog: Arc<TableCatalog>,
    pub orchestrator: ExtractionOrchestrator,
    aggregation: AggregationClient,
}

impl ExtractionEngine {
    /// A prober over this engine's aggregation client.
    pub fn prober(&self) -> CompatibilityProber {
        CompatibilityProber::new(
            self.aggregation.clone(),
            &self.environment,
            self.settings.poll_interval(),
            self.settings.max_polls,
        )
    }

    /// Folds the orchestrator's observations into the stored profile.
    ///
    /// Returns how many fields were newly flagged; the profile is only
    /// written when that is non-zero. The read-modify-write holds the
    /// profile file lock, so engines in other processes cannot lose flags.
    pub async fn persist_observations(&self) -> Result<usize> {
        let observations = self.orchestrator.drain_observations();
        if observations.is_empty() {
            return Ok(0);
        }

        let count = observations.len();
        let flagged = self
            .profiles
            .update(&self.environment, move |profile| {
                apply_observations(profile, &observations)
            })
            .await
            .map_err(|e| anyhow!("Failed to update compatibility profile: {}", e))?;
        tracing::info!(
            target: "tabula::bootstrap",
            observations = count,
            flagged,
            "[Bootstrap] Observations persisted"
        );
        Ok(flagged)
    }
}

/// Builds an engine from the config file, environment-variable credentials
/// and the HTTP transport.
pub fn bootstrap(options: BootstrapOptions) -> Result<ExtractionEngine> {
    let base_path = options.base_path.as_deref();
    let config_service = ConfigService::new(base_path)
        .map_err(|e| anyhow!("Failed to locate configuration: {}", e))?;
    let config = config_service
        .get_config()
        .map_err(|e| anyhow!("Failed to load configuration: {}", e))?;

    let environment = match options.environment {
        Some(environment) => environment,
        None => config_service
            .active_environment()
            .map_err(|e| anyhow!("Failed to resolve active environment: {}", e))?,
    };
    let settings = config.extraction.clone();
    let environment_config = config.environment(&environment);

    tracing::info!(
        target: "tabula::bootstrap",
        environment = %environment,
        base_url = %environment_config.base_url,
        config = %config_service.path().display(),
        "[Bootstrap] Building extraction engine"
    );

    let api: Arc<dyn TableApi> = Arc::new(
        HttpTableApi::new(&environment_config, settings.request_timeout())
            .map_err(|e| anyhow!("Failed to build table client: {}", e))?,
    );
    let issuer: Arc<dyn TokenIssuer> = Arc::new(
        HttpTokenIssuer::new(config.merged_environments(), settings.request_timeout())
            .map_err(|e| anyhow!("Failed to build token client: {}", e))?,
    );
    let credentials: Arc<dyn CredentialStore> = Arc::new(EnvCredentialStore::new());

    let snapshots = Arc::new(
        JsonSnapshotRepository::new(base_path, &environment)
            .map_err(|e| anyhow!("Failed to locate snapshot directory: {}", e))?,
    );
    let profiles = Arc::new(
        ProfileStore::new(Arc::new(TomlProfileRepository::new(base_path)))
            .with_max_age(settings.profile_max_age())
            .with_refresh_interval(settings.profile_refresh()),
    );

    Ok(assemble(
        environment,
        settings,
        api,
        issuer,
        credentials,
        profiles,
        snapshots,
    ))
}

/// Connects already-built seams. Used by [`bootstrap`] and by hosts that
/// bring their own transport or storage.
pub fn assemble(
    environment: String,
    settings: ExtractionSettings,
    api: Arc<dyn TableApi>,
    issuer: Arc<dyn TokenIssuer>,
    credentials: Arc<dyn CredentialStore>,
    profiles: Arc<ProfileStore>,
    snapshots: Arc<dyn tabula_core::SnapshotRepository>,
) -> ExtractionEngine {
    let tokens = Arc::new(
        TokenManager::new(issuer, credentials)
            .with_safety_margin(settings.token_safety_margin())
            .with_request_timeout(settings.request_timeout()),
    );
    let fetcher = Arc::new(PaginatedFetcher::new(
        api.clone(),
        tokens.clone(),
        &environment,
        FetchSettings::from(&settings),
    ));
    let cache = Arc::new(IncrementalCache::new(fetcher.clone(), snapshots));
    let catalog = Arc::new(TableCatalog::new(
        api.clone(),
        tokens.clone(),
        &environment,
        settings.request_timeout(),
    ));
    let aggregation = AggregationClient::new(
        api,
        tokens.clone(),
        &environment,
        settings.request_timeout(),
    );
    let orchestrator = ExtractionOrchestrator::new(
        &environment,
        settings.clone(),
        profiles.clone(),
        aggregation.clone(),
        fetcher.clone(),
    )
    .with_cache(cache.clone())
    .with_catalog(catalog.clone());

    ExtractionEngine {
        environment,
        settings,
        tokens,
        profiles,
        fetcher,
        cache,
        catalog,
        orchestrator,
        aggregation,
    }
}
