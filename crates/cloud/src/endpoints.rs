//! Endpoints of the Azure cloud instances.

use azure_config::api::CloudName;
use serde::{Deserialize, Serialize};

/// Service endpoints of one Azure cloud instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudEndpoints {
    /// Azure AD authority, e.g. `https://login.microsoftonline.com`.
    pub authority: String,
    /// Resource Manager endpoint, e.g. `https://management.azure.com`.
    pub resource_manager: String,
    /// Storage DNS suffix, e.g. `core.windows.net`.
    pub storage_suffix: String,
}

impl CloudEndpoints {
    /// Azure public cloud.
    #[must_use]
    pub fn public() -> Self {
        Self::new(
            "https://login.microsoftonline.com",
            "https://management.azure.com",
            "core.windows.net",
        )
    }

    /// Azure US Government.
    #[must_use]
    pub fn government() -> Self {
        Self::new(
            "https://login.microsoftonline.us",
            "https://management.usgovcloudapi.net",
            "core.usgovcloudapi.net",
        )
    }

    /// Azure China (21Vianet).
    #[must_use]
    pub fn china() -> Self {
        Self::new(
            "https://login.chinacloudapi.cn",
            "https://management.chinacloudapi.cn",
            "core.chinacloudapi.cn",
        )
    }

    /// Custom endpoints of a private cloud.
    #[must_use]
    pub fn new(
        authority: impl Into<String>,
        resource_manager: impl Into<String>,
        storage_suffix: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into().trim_end_matches('/').to_string(),
            resource_manager: resource_manager.into().trim_end_matches('/').to_string(),
            storage_suffix: storage_suffix.into(),
        }
    }

    /// Token scope for Resource Manager calls.
    #[must_use]
    pub fn resource_manager_scope(&self) -> String {
        format!("{}/.default", self.resource_manager)
    }

    /// Token scope for blob data-plane calls.
    #[must_use]
    pub fn storage_scope(&self) -> String {
        "https://storage.azure.com/.default".to_string()
    }

    /// Blob service URL of a storage account.
    #[must_use]
    pub fn blob_service_url(&self, account: &str) -> String {
        format!("https://{account}.blob.{}", self.storage_suffix)
    }
}

impl From<CloudName> for CloudEndpoints {
    fn from(name: CloudName) -> Self {
        match name {
            CloudName::AzurePublic => Self::public(),
            CloudName::AzureGovernment => Self::government(),
            CloudName::AzureChina => Self::china(),
        }
    }
}

impl Default for CloudEndpoints {
    fn default() -> Self {
        Self::public()
    }
}
