//! Request authentication for HTTP sinks

use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use twincdc_core::{Result, TwinCdcError};
use twincdc_shared::AuthConfig;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Applies the configured credentials to each outgoing request.
///
/// Nothing is stored on the shared `Client`; OAuth tokens live in a cache
/// guarded by a mutex so concurrent senders fetch a token only once.
pub struct RequestAuthenticator {
    config: AuthConfig,
    token: Mutex<Option<CachedToken>>,
}

impl RequestAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            token: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub async fn apply(&self, client: &Client, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(match &self.config {
            AuthConfig::None => request,
            AuthConfig::Basic { username, password } => request.basic_auth(username, Some(password)),
            AuthConfig::Bearer { token } => request.bearer_auth(token),
            AuthConfig::ApiKey { header, key } => request.header(header.as_str(), key.as_str()),
            AuthConfig::OAuth { .. } => {
                let token = self.oauth_token(client).await?;
                request.bearer_auth(token)
            }
        })
    }

    /// Current OAuth access token, fetched with the client credentials
    /// grant when the cached one is missing or about to expire.
    pub async fn oauth_token(&self, client: &Client) -> Result<String> {
        let AuthConfig::OAuth {
            token_url,
            client_id,
            client_secret,
            scope,
        } = &self.config
        else {
            return Err(TwinCdcError::ConfigError("OAuth token requested for non-OAuth auth".to_string()));
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        if let Some(scope) = scope {
            form.push(("scope", scope.as_str()));
        }

        let response = client
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| TwinCdcError::HttpError(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(TwinCdcError::HttpError(format!(
                "Token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TwinCdcError::HttpError(format!("Invalid token response: {}", e)))?;

        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        debug!(?lifetime, "OAuth token acquired");

        *cached = Some(CachedToken {
            token: body.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        });
        Ok(body.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::AUTHORIZATION;

    async fn built_request(auth: AuthConfig) -> reqwest::Request {
        let client = Client::new();
        let authenticator = RequestAuthenticator::new(auth);
        authenticator
            .apply(&client, client.post("http://localhost/hook"))
            .await
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_static_auth_modes() {
        let request = built_request(AuthConfig::None).await;
        assert!(request.headers().get(AUTHORIZATION).is_none());

        let request = built_request(AuthConfig::Bearer {
            token: "abc".to_string(),
        })
        .await;
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer abc");

        let request = built_request(AuthConfig::Basic {
            username: "user".to_string(),
            password: "pass".to_string(),
        })
        .await;
        assert_eq!(request.headers()[AUTHORIZATION], "Basic dXNlcjpwYXNz");

        let request = built_request(AuthConfig::ApiKey {
            header: "x-api-key".to_string(),
            key: "secret".to_string(),
        })
        .await;
        assert_eq!(request.headers()["x-api-key"], "secret");
    }

    #[tokio::test]
    async fn test_cached_oauth_token_is_reused() {
        let authenticator = RequestAuthenticator::new(AuthConfig::OAuth {
            token_url: "http://127.0.0.1:1/token".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            scope: None,
        });
        *authenticator.token.lock().await = Some(CachedToken {
            token: "cached".to_string(),
            refresh_at: Instant::now() + Duration::from_secs(600),
        });

        let client = Client::new();
        assert_eq!(authenticator.oauth_token(&client).await.unwrap(), "cached");
    }

    #[tokio::test]
    async fn test_expired_oauth_token_is_refetched() {
        let authenticator = RequestAuthenticator::new(AuthConfig::OAuth {
            token_url: "http://127.0.0.1:1/token".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            scope: Some("https://kusto.kusto.windows.net/.default".to_string()),
        });
        *authenticator.token.lock().await = Some(CachedToken {
            token: "stale".to_string(),
            refresh_at: Instant::now(),
        });

        let client = Client::new();
        assert!(matches!(
            authenticator.oauth_token(&client).await,
            Err(TwinCdcError::HttpError(_))
        ));
    }
}
