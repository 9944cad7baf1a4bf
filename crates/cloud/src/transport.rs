//! Resource Manager transport.
//!
//! Every typed client goes through [`ArmTransport`], which addresses objects
//! by resource ID. [`ArmClient`] implements it over HTTPS; tests swap in the
//! in-memory fake from the `testing` module.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::endpoints::CloudEndpoints;
use crate::token::TokenSource;
use crate::{CloudError, Result};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Polling interval while waiting for long-running operations.
const POLL_INTERVAL_SECS: u64 = 5;

/// Upper bound for a single long-running operation.
const OPERATION_TIMEOUT_SECS: u64 = 30 * 60;

/// Generic access to Resource Manager objects.
///
/// A 404 on GET is `Ok(None)`; a 404 on DELETE is success. Dropping a
/// returned future aborts the underlying request.
#[async_trait]
pub trait ArmTransport: Send + Sync {
    /// Reads an object.
    async fn get(&self, id: &str, api_version: &str) -> Result<Option<Value>>;

    /// Creates or replaces an object and waits until it is provisioned.
    async fn put(&self, id: &str, api_version: &str, body: Value) -> Result<Value>;

    /// Deletes an object and waits until it is gone.
    async fn delete(&self, id: &str, api_version: &str) -> Result<()>;

    /// Lists the objects below a collection path, following `nextLink`.
    async fn list(&self, path: &str, api_version: &str) -> Result<Vec<Value>>;

    /// Invokes an action such as `lock` on an object.
    async fn post(
        &self,
        id: &str,
        action: &str,
        api_version: &str,
        headers: &[(&str, &str)],
    ) -> Result<()>;
}

/// HTTPS implementation of [`ArmTransport`].
#[derive(Clone)]
pub struct ArmClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    scope: String,
    poll_interval: Duration,
}

impl ArmClient {
    /// Creates a client for the cloud's Resource Manager endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new(endpoints: &CloudEndpoints, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(CloudError::Http)?;

        Ok(Self {
            client,
            base_url: endpoints.resource_manager.clone(),
            tokens,
            scope: endpoints.resource_manager_scope(),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
        })
    }

    /// Overrides the polling interval of long-running operations.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str, api_version: &str) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{}{path}{separator}api-version={api_version}", self.base_url)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        debug!(method = %method, url = %url, "ARM request");
        let token = self.tokens.token(&self.scope).await?;
        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {token}"));
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Handle API response.
    async fn handle_response(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                CloudError::Serialization(e)
            })
        } else if status == StatusCode::UNAUTHORIZED {
            Err(CloudError::Auth(text))
        } else {
            Err(CloudError::from_response(status.as_u16(), text))
        }
    }

    async fn wait_provisioned(
        &self,
        id: &str,
        api_version: &str,
        mut current: Value,
    ) -> Result<Value> {
        let start = std::time::Instant::now();
        loop {
            let state = provisioning_state(&current).map(str::to_string);
            match state.as_deref() {
                None | Some("Succeeded") => return Ok(current),
                Some(state @ ("Failed" | "Canceled")) => {
                    return Err(CloudError::OperationFailed {
                        id: id.to_string(),
                        state: state.to_string(),
                    })
                }
                Some(state) => {
                    debug!(
                        id = %id,
                        state = %state,
                        elapsed_secs = start.elapsed().as_secs(),
                        "Waiting for provisioning"
                    );
                }
            }
            if start.elapsed() > Duration::from_secs(OPERATION_TIMEOUT_SECS) {
                return Err(CloudError::Timeout {
                    id: id.to_string(),
                    seconds: OPERATION_TIMEOUT_SECS,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            current = self
                .get(id, api_version)
                .await?
                .ok_or_else(|| CloudError::NotFound(id.to_string()))?;
        }
    }

    async fn wait_deleted(&self, id: &str, api_version: &str) -> Result<()> {
        let start = std::time::Instant::now();
        while self.get(id, api_version).await?.is_some() {
            if start.elapsed() > Duration::from_secs(OPERATION_TIMEOUT_SECS) {
                return Err(CloudError::Timeout {
                    id: id.to_string(),
                    seconds: OPERATION_TIMEOUT_SECS,
                });
            }
            debug!(id = %id, elapsed_secs = start.elapsed().as_secs(), "Waiting for deletion");
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }
}

fn provisioning_state(value: &Value) -> Option<&str> {
    value
        .pointer("/properties/provisioningState")
        .and_then(Value::as_str)
}

#[async_trait]
impl ArmTransport for ArmClient {
    async fn get(&self, id: &str, api_version: &str) -> Result<Option<Value>> {
        let response = self
            .send(Method::GET, &self.url(id, api_version), None, &[])
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::handle_response(response).await.map(Some)
    }

    async fn put(&self, id: &str, api_version: &str, body: Value) -> Result<Value> {
        let response = self
            .send(Method::PUT, &self.url(id, api_version), Some(&body), &[])
            .await?;
        let accepted = response.status() == StatusCode::ACCEPTED;
        let current = Self::handle_response(response).await?;
        let current = if accepted || current.is_null() {
            self.get(id, api_version)
                .await?
                .ok_or_else(|| CloudError::NotFound(id.to_string()))?
        } else {
            current
        };
        self.wait_provisioned(id, api_version, current).await
    }

    async fn delete(&self, id: &str, api_version: &str) -> Result<()> {
        let response = self
            .send(Method::DELETE, &self.url(id, api_version), None, &[])
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        Self::handle_response(response).await?;
        if status == StatusCode::ACCEPTED {
            self.wait_deleted(id, api_version).await?;
        }
        Ok(())
    }

    async fn list(&self, path: &str, api_version: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut next = Some(self.url(path, api_version));
        while let Some(url) = next.take() {
            let response = self.send(Method::GET, &url, None, &[]).await?;
            let mut page = Self::handle_response(response).await?;
            if let Some(Value::Array(values)) = page.get_mut("value").map(Value::take) {
                items.extend(values);
            }
            next = page
                .get("nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(items)
    }

    async fn post(
        &self,
        id: &str,
        action: &str,
        api_version: &str,
        headers: &[(&str, &str)],
    ) -> Result<()> {
        let url = self.url(&format!("{id}/{action}"), api_version);
        let response = self.send(Method::POST, &url, None, headers).await?;
        Self::handle_response(response).await.map(|_| ())
    }
}
