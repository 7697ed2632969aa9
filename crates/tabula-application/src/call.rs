//! Deadline and one-shot re-authentication around single backend calls.

use crate::token_manager::TokenManager;
use std::future::Future;
use std::time::Duration;
use tabula_core::{ApiError, Credential, Result, TabulaError};

/// Bounds a backend call; an elapsed deadline becomes [`ApiError::Timeout`].
pub(crate) async fn with_deadline<T, F>(deadline: Duration, call: F) -> std::result::Result<T, ApiError>
where
    F: Future<Output = std::result::Result<T, ApiError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or(Err(ApiError::Timeout))
}

/// Runs `op` with a valid token. A 401 forces one refresh and one retry; a
/// second 401 is [`TabulaError::AuthExpired`].
pub(crate) async fn authorized<T, F, Fut>(
    tokens: &TokenManager,
    environment: &str,
    deadline: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut(Credential) -> Fut,
    Fut: Future<Output = std::result::Result<T, ApiError>>,
{
    let credential = tokens.get_valid_token(environment).await?;
    match with_deadline(deadline, op(credential.clone())).await {
        Err(e) if e.is_unauthorized() => {
            tracing::warn!(
                target: "tabula::auth",
                environment,
                "[Auth] Request rejected with 401, forcing token refresh"
            );
            let credential = tokens.refresh_rejected(environment, &credential).await?;
            match with_deadline(deadline, op(credential)).await {
                Err(e) if e.is_unauthorized() => Err(TabulaError::auth_expired(
                    environment,
                    "request rejected again after token refresh",
                )),
                other => other.map_err(|e| e.into_tabula(environment)),
            }
        }
        other => other.map_err(|e| e.into_tabula(environment)),
    }
}
