use crate::altered::client::{AlteredClient, AlteredError, ensure_success};
use crate::altered::config::{BEARER_TOKEN, SESSION_COOKIE};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::COOKIE;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("no session: {0}")]
    NoSession(String),
    #[error("not authenticated: log in to the platform and retry")]
    NotAuthenticated,
}

/// Supplies a bearer credential for the remote API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, TokenError>;
}

/// Fixed token taken from configuration.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}

/// Reads the access token from the web front-end's session endpoint using an
/// existing browser session cookie.
#[derive(Debug, Clone)]
pub struct SessionTokenProvider {
    client: AlteredClient,
    cookie: String,
}

impl SessionTokenProvider {
    pub fn new(client: AlteredClient, cookie: impl Into<String>) -> Self {
        Self {
            client,
            cookie: cookie.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    #[serde(default)]
    access_token: Option<String>,
}

#[async_trait]
impl TokenProvider for SessionTokenProvider {
    async fn bearer_token(&self) -> Result<String, TokenError> {
        let response = self
            .client
            .http
            .get(self.client.web_url("api/auth/session"))
            .query(&[("_t", Utc::now().timestamp_millis().to_string())])
            .header(COOKIE, &self.cookie)
            .send()
            .await
            .map_err(|err| TokenError::NoSession(err.to_string()))?;
        let response = ensure_success(response).await.map_err(|err| match err {
            AlteredError::Status { status, .. } => {
                TokenError::NoSession(format!("session API failed: {status}"))
            }
            other => TokenError::NoSession(other.to_string()),
        })?;
        let session: SessionResponse = response
            .json()
            .await
            .map_err(|err| TokenError::NoSession(err.to_string()))?;
        session
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(TokenError::NotAuthenticated)
    }
}

/// Provider used when no credential source is configured.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredTokenProvider;

#[async_trait]
impl TokenProvider for UnconfiguredTokenProvider {
    async fn bearer_token(&self) -> Result<String, TokenError> {
        Err(TokenError::NoSession(
            "set ALTERED_BEARER_TOKEN or ALTERED_SESSION_COOKIE".into(),
        ))
    }
}

pub fn token_provider_from_env(client: &AlteredClient) -> Arc<dyn TokenProvider> {
    if let Some(token) = BEARER_TOKEN.as_ref() {
        info!(target = "altered.client", "using static bearer token");
        return Arc::new(StaticTokenProvider::new(token.clone()));
    }
    if let Some(cookie) = SESSION_COOKIE.as_ref() {
        info!(target = "altered.client", "using session cookie token provider");
        return Arc::new(SessionTokenProvider::new(client.clone(), cookie.clone()));
    }
    Arc::new(UnconfiguredTokenProvider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn session_provider_reads_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/session"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accessToken": "tok-123",
                "user": {"email": "me@example.com"}
            })))
            .mount(&server)
            .await;

        let client = AlteredClient::new("http://127.0.0.1:9", server.uri());
        let provider = SessionTokenProvider::new(client, "session=abc");
        assert_eq!(provider.bearer_token().await, Ok("tok-123".to_string()));
    }

    #[tokio::test]
    async fn session_provider_without_token_is_not_authenticated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = AlteredClient::new("http://127.0.0.1:9", server.uri());
        let provider = SessionTokenProvider::new(client, "session=expired");
        assert_eq!(
            provider.bearer_token().await,
            Err(TokenError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn unconfigured_provider_reports_no_session() {
        let err = UnconfiguredTokenProvider
            .bearer_token()
            .await
            .expect_err("no credential");
        assert!(matches!(err, TokenError::NoSession(_)));
    }
}
