//! Azure AD access tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::credentials::{ClientAuth, Credentials};
use crate::endpoints::CloudEndpoints;
use crate::{CloudError, Result};

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 300;

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Source of bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a valid access token for `scope`.
    async fn token(&self, scope: &str) -> Result<String>;
}

/// A fixed token, for tests and pre-authenticated callers.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self, _scope: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Client-credentials token provider with a per-scope cache.
#[derive(Clone)]
pub struct AadTokenProvider {
    client: Client,
    endpoints: CloudEndpoints,
    credentials: Credentials,
    cache: Arc<RwLock<HashMap<String, CachedToken>>>,
}

impl AadTokenProvider {
    /// Creates a provider.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new(endpoints: CloudEndpoints, credentials: Credentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(CloudError::Http)?;
        Ok(Self {
            client,
            endpoints,
            credentials,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn request(&self, scope: &str) -> Result<CachedToken> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.endpoints.authority, self.credentials.tenant_id
        );
        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.credentials.client_id.clone()),
            ("scope", scope.to_string()),
        ];
        match &self.credentials.auth {
            ClientAuth::Secret(secret) => form.push(("client_secret", secret.clone())),
            ClientAuth::WorkloadIdentity { token_file } => {
                let assertion = tokio::fs::read_to_string(token_file).await.map_err(|e| {
                    CloudError::Auth(format!(
                        "cannot read workload identity token {}: {e}",
                        token_file.display()
                    ))
                })?;
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
                form.push(("client_assertion", assertion.trim().to_string()));
            }
        }

        debug!(scope = %scope, tenant = %self.credentials.tenant_id, "Requesting access token");
        let response = self.client.post(&url).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CloudError::Auth(format!(
                "token request failed with {}: {body}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        Ok(CachedToken {
            value: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in),
        })
    }
}

#[async_trait]
impl TokenSource for AadTokenProvider {
    async fn token(&self, scope: &str) -> Result<String> {
        let fresh = |token: &CachedToken| {
            token.expires_at - chrono::Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now()
        };

        if let Some(token) = self.cache.read().await.get(scope).filter(|t| fresh(t)) {
            return Ok(token.value.clone());
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = cache.get(scope).filter(|t| fresh(t)) {
            return Ok(token.value.clone());
        }
        let token = self.request(scope).await?;
        let value = token.value.clone();
        cache.insert(scope.to_string(), token);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials {
            client_id: "client".to_string(),
            tenant_id: "tenant".to_string(),
            subscription_id: "sub".to_string(),
            auth: ClientAuth::Secret("s3cr3t".to_string()),
            storage_account: None,
        }
    }

    #[tokio::test]
    async fn tokens_are_cached_per_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/v2.0/token"))
            .and(body_string_contains("client_secret=s3cr3t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let endpoints = CloudEndpoints::new(server.uri(), "https://arm.example", "s.example");
        let provider = AadTokenProvider::new(endpoints, credentials()).unwrap();

        assert_eq!(provider.token("scope").await.unwrap(), "abc");
        assert_eq!(provider.token("scope").await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn nearly_expired_tokens_are_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "short",
                "expires_in": 60
            })))
            .expect(2)
            .mount(&server)
            .await;

        let endpoints = CloudEndpoints::new(server.uri(), "https://arm.example", "s.example");
        let provider = AadTokenProvider::new(endpoints, credentials()).unwrap();

        provider.token("scope").await.unwrap();
        provider.token("scope").await.unwrap();
    }

    #[tokio::test]
    async fn rejected_credentials_are_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("AADSTS7000215: Invalid client secret"))
            .mount(&server)
            .await;

        let endpoints = CloudEndpoints::new(server.uri(), "https://arm.example", "s.example");
        let provider = AadTokenProvider::new(endpoints, credentials()).unwrap();

        let err = provider.token("scope").await.unwrap_err();
        assert!(matches!(err, CloudError::Auth(ref msg) if msg.contains("AADSTS7000215")));
    }
}
