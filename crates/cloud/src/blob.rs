//! Blob data-plane access for backup entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::endpoints::CloudEndpoints;
use crate::token::TokenSource;
use crate::{CloudError, Result};

const STORAGE_API_VERSION: &str = "2023-11-03";

/// Listing and deletion of blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Names of all blobs in `container` starting with `prefix`.
    async fn list_blobs(&self, account: &str, container: &str, prefix: &str)
        -> Result<Vec<String>>;

    /// Deletes a blob with its snapshots. Missing blobs are not an error.
    async fn delete_blob(&self, account: &str, container: &str, name: &str) -> Result<()>;
}

/// Deletes every blob under `prefix` and returns how many were deleted.
///
/// # Errors
///
/// Returns the first listing or deletion error.
pub async fn delete_prefix(
    store: &dyn BlobStore,
    account: &str,
    container: &str,
    prefix: &str,
) -> Result<usize> {
    let blobs = store.list_blobs(account, container, prefix).await?;
    for name in &blobs {
        store.delete_blob(account, container, name).await?;
    }
    info!(container = %container, prefix = %prefix, deleted = blobs.len(), "Deleted blobs");
    Ok(blobs.len())
}

#[derive(Debug, Deserialize)]
#[serde(rename = "EnumerationResults")]
struct EnumerationResults {
    #[serde(rename = "Blobs", default)]
    blobs: Blobs,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Blobs {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
struct BlobItem {
    #[serde(rename = "Name")]
    name: String,
}

/// HTTPS implementation of [`BlobStore`].
#[derive(Clone)]
pub struct BlobClient {
    client: Client,
    endpoints: CloudEndpoints,
    tokens: Arc<dyn TokenSource>,
    base_url: Option<String>,
}

impl BlobClient {
    /// Creates a client for the cloud's storage endpoints.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new(endpoints: CloudEndpoints, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(CloudError::Http)?;
        Ok(Self {
            client,
            endpoints,
            tokens,
            base_url: None,
        })
    }

    /// Sends every request to `base_url` instead of the account host.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn account_url(&self, account: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/{account}", base.trim_end_matches('/')),
            None => self.endpoints.blob_service_url(account),
        }
    }

    /// URL of a path below the account, percent-encoding each segment.
    fn url(&self, account: &str, segments: &[&str]) -> Result<Url> {
        let base = self.account_url(account);
        let mut url = Url::parse(&base)
            .map_err(|e| CloudError::Config(format!("invalid blob endpoint {base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| CloudError::Config(format!("invalid blob endpoint {base}")))?
            .pop_if_empty()
            .extend(segments.iter().flat_map(|segment| segment.split('/')));
        Ok(url)
    }

    async fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.token(&self.endpoints.storage_scope()).await?;
        Ok(request
            .header("Authorization", format!("Bearer {token}"))
            .header("x-ms-version", STORAGE_API_VERSION))
    }
}

#[async_trait]
impl BlobStore for BlobClient {
    async fn list_blobs(
        &self,
        account: &str,
        container: &str,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let url = self.url(account, &[container])?;
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![
                ("restype", "container".to_string()),
                ("comp", "list".to_string()),
                ("prefix", prefix.to_string()),
            ];
            if let Some(marker) = &marker {
                query.push(("marker", marker.clone()));
            }
            let request = self.authorized(self.client.get(url.clone()).query(&query)).await?;
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(CloudError::from_response(status.as_u16(), body));
            }

            let page: EnumerationResults = quick_xml::de::from_str(&body)?;
            names.extend(page.blobs.blob.into_iter().map(|b| b.name));
            debug!(container = %container, listed = names.len(), "Listed blob page");

            match page.next_marker.filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => return Ok(names),
            }
        }
    }

    async fn delete_blob(&self, account: &str, container: &str, name: &str) -> Result<()> {
        let url = self.url(account, &[container, name])?;
        let request = self
            .authorized(self.client.delete(url))
            .await?
            .header("x-ms-delete-snapshots", "include");
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await?;
        Err(CloudError::from_response(status.as_u16(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::StaticToken;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> BlobClient {
        BlobClient::new(CloudEndpoints::public(), Arc::new(StaticToken("t".to_string())))
            .unwrap()
            .with_base_url(server.uri())
    }

    const PAGE_ONE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="backups">
  <Prefix>shoot--a--b/</Prefix>
  <Blobs>
    <Blob><Name>shoot--a--b/full-1</Name><Properties/></Blob>
    <Blob><Name>shoot--a--b/incr-2</Name><Properties/></Blob>
  </Blobs>
  <NextMarker>page2</NextMarker>
</EnumerationResults>"#;

    const PAGE_TWO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ContainerName="backups">
  <Blobs>
    <Blob><Name>shoot--a--b/incr-3</Name></Blob>
  </Blobs>
  <NextMarker />
</EnumerationResults>"#;

    #[tokio::test]
    async fn listing_follows_markers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/acct/backups"))
            .and(query_param("marker", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE_TWO))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/acct/backups"))
            .and(query_param("prefix", "shoot--a--b/"))
            .and(header("x-ms-version", STORAGE_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE_ONE))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let names = client(&server)
            .list_blobs("acct", "backups", "shoot--a--b/")
            .await
            .unwrap();
        assert_eq!(
            names,
            vec!["shoot--a--b/full-1", "shoot--a--b/incr-2", "shoot--a--b/incr-3"]
        );
    }

    #[tokio::test]
    async fn deleting_missing_blobs_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/acct/backups/gone"))
            .and(header("x-ms-delete-snapshots", "include"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .delete_blob("acct", "backups", "gone")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_prefix_removes_every_listed_blob() {
        let store = crate::testing::FakeBlobStore::new();
        store.insert("acct", "backups", "shoot--a--b/one");
        store.insert("acct", "backups", "shoot--a--b/two");
        store.insert("acct", "backups", "shoot--a--bc/other");

        let deleted = delete_prefix(&store, "acct", "backups", "shoot--a--b/")
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.blobs("acct", "backups"), vec!["shoot--a--bc/other"]);
    }
}
