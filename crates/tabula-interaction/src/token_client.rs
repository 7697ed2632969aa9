//! reqwest implementation of [`TokenIssuer`] against the JWT endpoints.

use crate::response::classify_status;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::COOKIE;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tabula_core::config::EnvironmentConfig;
use tabula_core::{ApiError, Credential, Result, SessionCredential, TabulaError, TokenIssuer};

#[derive(Debug, Deserialize)]
struct TokenPair {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// Issues and refreshes bearer tokens for a set of environments.
#[derive(Debug, Clone)]
pub struct HttpTokenIssuer {
    client: Client,
    /// Environment name to base URL.
    base_urls: BTreeMap<String, String>,
}

impl HttpTokenIssuer {
    pub fn new(
        environments: impl IntoIterator<Item = (String, EnvironmentConfig)>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TabulaError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, environments))
    }

    pub fn with_client(
        client: Client,
        environments: impl IntoIterator<Item = (String, EnvironmentConfig)>,
    ) -> Self {
        let base_urls = environments
            .into_iter()
            .map(|(name, config)| (name, config.base_url.trim_end_matches('/').to_string()))
            .collect();
        Self { client, base_urls }
    }

    fn endpoint(&self, environment: &str, path: &str) -> String {
        let base = self
            .base_urls
            .get(environment)
            .cloned()
            .unwrap_or_else(|| EnvironmentConfig::conventional(environment).base_url);
        format!("{}/jwt/api/token/{}", base, path)
    }

    async fn exchange(
        &self,
        url: &str,
        session: &SessionCredential,
        body: Option<serde_json::Value>,
    ) -> std::result::Result<TokenPair, ApiError> {
        let mut request = self
            .client
            .post(url)
            .header(COOKIE, session.cookie_header())
            .header("X-CSRFToken", &session.csrf_token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Network(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(classify_status(status, &text));
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(format!("token response: {}", e)))
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(
        &self,
        environment: &str,
        session: &SessionCredential,
    ) -> std::result::Result<Credential, ApiError> {
        let url = self.endpoint(environment, "");
        let pair = self.exchange(&url, session, None).await?;
        tracing::debug!(target: "tabula::auth", environment, "Issued new token pair");
        Ok(Credential::from_tokens(
            pair.access,
            pair.refresh,
            session.csrf_token.clone(),
        ))
    }

    async fn refresh(
        &self,
        environment: &str,
        session: &SessionCredential,
        refresh_token: &str,
    ) -> std::result::Result<Credential, ApiError> {
        let url = self.endpoint(environment, "refresh/");
        let pair = self
            .exchange(&url, session, Some(json!({ "refresh": refresh_token })))
            .await?;
        tracing::debug!(target: "tabula::auth", environment, "Refreshed access token");
        // The refresh endpoint may omit a rotated refresh token; keep the old one.
        Ok(Credential::from_tokens(
            pair.access,
            pair.refresh.or_else(|| Some(refresh_token.to_string())),
            session.csrf_token.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        let issuer = HttpTokenIssuer::new(
            [(
                "app".to_string(),
                EnvironmentConfig::conventional("app"),
            )],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            issuer.endpoint("app", ""),
            "https://app.datarails.com/jwt/api/token/"
        );
        assert_eq!(
            issuer.endpoint("dev", "refresh/"),
            "https://dev.datarails.com/jwt/api/token/refresh/"
        );
    }

    #[test]
    fn test_token_pair_refresh_optional() {
        let pair: TokenPair = serde_json::from_str(r#"{"access": "a"}"#).unwrap();
        assert!(pair.refresh.is_none());
    }
}
