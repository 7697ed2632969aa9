//! Session credential stores.
//!
//! The session cookie pair is owned by whoever logged in (a browser export,
//! a keyring helper, CI secrets). These stores only read it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tabula_core::credential::{CredentialStore, SessionCredential};
use tabula_core::{Result, TabulaError};

/// Reads the session from environment variables.
///
/// Lookup order for environment `app`:
/// 1. `TABULA_APP_SESSION_ID` / `TABULA_APP_CSRF_TOKEN`
/// 2. `TABULA_SESSION_ID` / `TABULA_CSRF_TOKEN`
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self
    }

    fn scoped_var(environment: &str, suffix: &str) -> String {
        let env: String = environment
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("TABULA_{}_{}", env, suffix)
    }

    fn read(name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn lookup(environment: &str, suffix: &str) -> Option<String> {
        Self::read(&Self::scoped_var(environment, suffix))
            .or_else(|| Self::read(&format!("TABULA_{}", suffix)))
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn load_session(&self, environment: &str) -> Result<Option<SessionCredential>> {
        let session_id = Self::lookup(environment, "SESSION_ID");
        let csrf_token = Self::lookup(environment, "CSRF_TOKEN");

        match (session_id, csrf_token) {
            (Some(session_id), Some(csrf_token)) => {
                Ok(Some(SessionCredential::new(session_id, csrf_token)))
            }
            (None, None) => Ok(None),
            _ => Err(TabulaError::config(format!(
                "Incomplete session credential for environment '{}': both session id and CSRF token are required",
                environment
            ))),
        }
    }
}

/// Holds sessions in memory, keyed by environment.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    sessions: RwLock<HashMap<String, SessionCredential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding one session.
    pub fn with_session(environment: impl Into<String>, session: SessionCredential) -> Self {
        let store = Self::new();
        store.insert(environment, session);
        store
    }

    pub fn insert(&self, environment: impl Into<String>, session: SessionCredential) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(environment.into(), session);
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load_session(&self, environment: &str) -> Result<Option<SessionCredential>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| TabulaError::internal("credential store lock poisoned"))?;
        Ok(sessions.get(environment).cloned())
    }
}
