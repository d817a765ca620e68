//! OAuth2 client-credentials decorator for tenants that gate the API behind
//! bearer tokens. Wraps the shared client; journeys and replay handlers
//! stay token-agnostic.

use std::path::Path;
use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::{LoadClient, url_with};
use crate::error::{Error, Result};
use crate::metric::now_ms;

/// Tokens are treated as expired 5 minutes before the server-side 60-minute
/// lifetime runs out.
const TOKEN_VALIDITY_MS: i64 = 55 * 60 * 1000;

/// Client credentials, loaded from a JSON config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
}

impl AuthConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Auth(format!(
                "cannot read auth config {}: {e}\nexpected format: {{\"client_id\": \"...\", \"client_secret\": \"...\"}}",
                path.as_ref().display()
            ))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Auth(format!("auth config is not valid JSON: {e}")))
    }
}

struct TokenState {
    token: Option<String>,
    expires_at: i64,
}

/// Holds the bearer token and refreshes it under a lock, so concurrent
/// workers observing an expiry trigger exactly one fetch.
pub struct BearerAuth {
    client: Arc<LoadClient>,
    base_url: String,
    credentials: AuthConfig,
    state: Mutex<TokenState>,
}

impl BearerAuth {
    pub fn new(client: Arc<LoadClient>, base_url: impl Into<String>, credentials: AuthConfig) -> Self {
        BearerAuth {
            client,
            base_url: base_url.into(),
            credentials,
            state: Mutex::new(TokenState { token: None, expires_at: 0 }),
        }
    }

    /// Current token, refreshed if missing or within the expiry margin.
    /// Callers queue on the lock during a refresh and all get the fresh
    /// token.
    pub async fn token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = &state.token {
            if now_ms() < state.expires_at {
                return Ok(token.clone());
            }
        }
        info!("fetching new access token");
        let url = url_with(&self.base_url, "api/v1/token", &[])?;
        let request = self
            .client
            .request(reqwest::Method::POST, url)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
            ])
            .build()?;
        let response = self.client.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let _ = response.bytes().await;
            return Err(Error::Auth(format!("HTTP {}", status.as_u16())));
        }
        let body: Value = response.json().await?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Auth(format!("no access_token in response: {body}")))?
            .to_string();
        state.token = Some(token.clone());
        state.expires_at = now_ms() + TOKEN_VALIDITY_MS;
        info!("access token obtained, valid for 55 minutes");
        Ok(token)
    }

    /// Force the next [`token`](Self::token) call to refresh.
    pub async fn invalidate(&self) {
        self.state.lock().await.expires_at = 0;
    }
}

/// The authenticated variant of the client wrapper: attaches the bearer
/// token and retries the request at most once after a 401.
pub struct AuthedClient {
    inner: Arc<LoadClient>,
    auth: BearerAuth,
}

impl AuthedClient {
    pub fn new(client: Arc<LoadClient>, base_url: impl Into<String>, credentials: AuthConfig) -> Self {
        AuthedClient { inner: Arc::clone(&client), auth: BearerAuth::new(client, base_url, credentials) }
    }

    /// Acquire the initial token. Authenticated runs abort when this fails.
    pub async fn bootstrap(&self) -> Result<()> {
        self.auth.token().await.map(|_| ())
    }

    /// Run a request built by `build` with a bearer header. On 401 the
    /// token is refreshed and the request retried exactly once; the second
    /// answer stands either way.
    pub async fn execute<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let token = self.auth.token().await?;
        let request = build().header(AUTHORIZATION, format!("Bearer {token}")).build()?;
        let response = self.inner.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("401 from target, refreshing token and retrying once");
        let _ = response.bytes().await;
        self.auth.invalidate().await;
        let token = self.auth.token().await?;
        let request = build().header(AUTHORIZATION, format!("Bearer {token}")).build()?;
        self.inner.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_config_parses_the_documented_shape() {
        let config: AuthConfig =
            serde_json::from_str(r#"{"client_id": "abc", "client_secret": "xyz"}"#).unwrap();
        assert_eq!(config.client_id, "abc");
        assert_eq!(config.client_secret, "xyz");
    }

    #[test]
    fn missing_auth_config_is_an_auth_error() {
        let err = AuthConfig::from_file("/nonexistent/auth.json").unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(err.to_string().contains("client_id"));
    }
}
