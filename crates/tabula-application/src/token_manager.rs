//! Token lifecycle: cached bearer tokens with single-flight refresh.

use crate::call::with_deadline;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tabula_core::{Credential, CredentialStore, Result, TabulaError, TokenIssuer};
use tokio::sync::{Mutex, RwLock};

/// Expiry diagnostics for one environment. Never contains token material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenInfo {
    pub environment: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in_secs: i64,
    pub has_refresh_token: bool,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    /// Completed refreshes since this manager started.
    pub generation: u64,
}

/// Per-environment token state.
///
/// `generation` counts completed refreshes. A caller that recorded the
/// generation before waiting on `credential` and finds it advanced knows
/// another caller already refreshed on its behalf.
#[derive(Default)]
struct TokenSlot {
    credential: Mutex<Option<Credential>>,
    generation: AtomicU64,
}

/// Hands out valid bearer tokens per environment.
///
/// Concurrent callers never trigger more than one refresh for the same
/// environment: they queue on the slot lock and pick up the token the first
/// caller obtained.
pub struct TokenManager {
    issuer: Arc<dyn TokenIssuer>,
    credentials: Arc<dyn CredentialStore>,
    safety_margin: Duration,
    request_timeout: Duration,
    slots: RwLock<HashMap<String, Arc<TokenSlot>>>,
}

impl TokenManager {
    pub fn new(issuer: Arc<dyn TokenIssuer>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            issuer,
            credentials,
            safety_margin: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Remaining lifetime below which a cached token is refreshed.
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn slot(&self, environment: &str) -> Arc<TokenSlot> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(environment) {
                return slot.clone();
            }
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(environment.to_string())
            .or_insert_with(|| Arc::new(TokenSlot::default()))
            .clone()
    }

    /// Returns a token with more than the safety margin left, refreshing if needed.
    pub async fn get_valid_token(&self, environment: &str) -> Result<Credential> {
        let slot = self.slot(environment).await;
        let mut current = slot.credential.lock().await;

        if let Some(credential) = current.as_ref() {
            if credential.is_valid_for(self.safety_margin) {
                return Ok(credential.clone());
            }
            tracing::debug!(
                target: "tabula::auth",
                environment,
                expires_in_secs = credential.expires_in_secs(),
                "[TokenManager] Token inside safety margin, refreshing"
            );
        }

        let fresh = self.obtain(environment, current.as_ref()).await?;
        *current = Some(fresh.clone());
        slot.generation.fetch_add(1, Ordering::SeqCst);
        Ok(fresh)
    }

    /// Replaces the cached token regardless of its expiry.
    ///
    /// Used after the backend rejected a token. When another caller completed a
    /// refresh while this one waited, its token is returned instead.
    pub async fn force_refresh(&self, environment: &str) -> Result<Credential> {
        let slot = self.slot(environment).await;
        let observed = slot.generation.load(Ordering::SeqCst);
        let mut current = slot.credential.lock().await;

        if slot.generation.load(Ordering::SeqCst) != observed {
            if let Some(credential) = current.as_ref() {
                tracing::debug!(
                    target: "tabula::auth",
                    environment,
                    "[TokenManager] Refresh already completed by another caller"
                );
                return Ok(credential.clone());
            }
        }

        let fresh = self.obtain(environment, current.as_ref()).await?;
        *current = Some(fresh.clone());
        slot.generation.fetch_add(1, Ordering::SeqCst);
        Ok(fresh)
    }

    /// Replaces `rejected` after the backend answered 401 to it.
    ///
    /// When the cached token is no longer `rejected`, someone refreshed after
    /// the request went out and the cached token is returned unchanged, so a
    /// late 401 never rotates a token other callers already hold.
    pub async fn refresh_rejected(
        &self,
        environment: &str,
        rejected: &Credential,
    ) -> Result<Credential> {
        let slot = self.slot(environment).await;
        let mut current = slot.credential.lock().await;

        if let Some(credential) = current.as_ref() {
            if credential.access_token != rejected.access_token {
                tracing::debug!(
                    target: "tabula::auth",
                    environment,
                    "[TokenManager] Rejected token already replaced"
                );
                return Ok(credential.clone());
            }
        }

        let fresh = self.obtain(environment, current.as_ref()).await?;
        *current = Some(fresh.clone());
        slot.generation.fetch_add(1, Ordering::SeqCst);
        Ok(fresh)
    }

    /// Refresh hook for long-running work (pagination every N rows).
    pub async fn proactive_refresh(&self, environment: &str) -> Result<Credential> {
        tracing::info!(
            target: "tabula::auth",
            environment,
            "[TokenManager] Proactive token refresh"
        );
        self.force_refresh(environment).await
    }

    /// Drops the cached token; the next call fetches a new one.
    pub async fn invalidate(&self, environment: &str) {
        let slot = self.slot(environment).await;
        *slot.credential.lock().await = None;
    }

    pub async fn token_info(&self, environment: &str) -> Option<TokenInfo> {
        let slot = self.slot(environment).await;
        let current = slot.credential.lock().await;
        current.as_ref().map(|credential| TokenInfo {
            environment: environment.to_string(),
            issued_at: credential.issued_at,
            expires_at: credential.expires_at,
            expires_in_secs: credential.expires_in_secs(),
            has_refresh_token: credential.refresh_token.is_some(),
            refresh_expires_at: credential.refresh_expires_at,
            generation: slot.generation.load(Ordering::SeqCst),
        })
    }

    /// Gets a new token: refresh endpoint first, session exchange second.
    ///
    /// Called with the slot lock held.
    async fn obtain(&self, environment: &str, current: Option<&Credential>) -> Result<Credential> {
        let session = self
            .credentials
            .load_session(environment)
            .await?
            .ok_or_else(|| {
                TabulaError::auth_expired(environment, "no session credential available")
            })?;

        if let Some(credential) = current.filter(|c| c.can_refresh(self.safety_margin)) {
            if let Some(refresh_token) = credential.refresh_token.as_deref() {
                let refreshed = with_deadline(
                    self.request_timeout,
                    self.issuer.refresh(environment, &session, refresh_token),
                )
                .await;
                match refreshed {
                    Ok(credential) => {
                        tracing::info!(
                            target: "tabula::auth",
                            environment,
                            expires_in_secs = credential.expires_in_secs(),
                            "[TokenManager] Access token refreshed"
                        );
                        return Ok(credential);
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "tabula::auth",
                            environment,
                            error = %e,
                            "[TokenManager] Refresh failed, falling back to session exchange"
                        );
                    }
                }
            }
        }

        match with_deadline(self.request_timeout, self.issuer.issue(environment, &session)).await {
            Ok(credential) => {
                tracing::info!(
                    target: "tabula::auth",
                    environment,
                    expires_in_secs = credential.expires_in_secs(),
                    "[TokenManager] Issued new token pair"
                );
                Ok(credential)
            }
            Err(e) if e.is_unauthorized() => Err(TabulaError::auth_expired(
                environment,
                "session credential rejected; log in again",
            )),
            Err(e) => Err(e.into_tabula(environment)),
        }
    }
}
