//! Credentials read from the cloud provider secret.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{CloudError, Result};

/// Secret key of the client ID.
pub const CLIENT_ID_KEY: &str = "clientID";
/// Secret key of the client secret.
pub const CLIENT_SECRET_KEY: &str = "clientSecret";
/// Secret key of the subscription ID.
pub const SUBSCRIPTION_ID_KEY: &str = "subscriptionID";
/// Secret key of the tenant ID.
pub const TENANT_ID_KEY: &str = "tenantID";
/// Secret key of the projected workload identity token file.
pub const WORKLOAD_IDENTITY_TOKEN_FILE_KEY: &str = "workloadIdentityTokenFile";
/// Secret key of the storage account name (backup secrets).
pub const STORAGE_ACCOUNT_KEY: &str = "storageAccount";

/// How the extension proves its identity to Azure AD.
#[derive(Clone, PartialEq, Eq)]
pub enum ClientAuth {
    /// Service principal with a client secret.
    Secret(String),
    /// Federated token read from a file on every token refresh.
    WorkloadIdentity { token_file: PathBuf },
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("Secret(<redacted>)"),
            Self::WorkloadIdentity { token_file } => f
                .debug_struct("WorkloadIdentity")
                .field("token_file", token_file)
                .finish(),
        }
    }
}

/// Azure credentials of a shoot or backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub tenant_id: String,
    pub subscription_id: String,
    pub auth: ClientAuth,
    pub storage_account: Option<String>,
}

impl Credentials {
    /// Reads credentials from secret data.
    ///
    /// A `workloadIdentityTokenFile` entry selects workload identity;
    /// otherwise `clientSecret` is required.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Config`] when a required key is missing, empty
    /// or not UTF-8.
    pub fn from_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let auth = match optional(data, WORKLOAD_IDENTITY_TOKEN_FILE_KEY)? {
            Some(path) => ClientAuth::WorkloadIdentity {
                token_file: PathBuf::from(path),
            },
            None => ClientAuth::Secret(required(data, CLIENT_SECRET_KEY)?),
        };

        Ok(Self {
            client_id: required(data, CLIENT_ID_KEY)?,
            tenant_id: required(data, TENANT_ID_KEY)?,
            subscription_id: required(data, SUBSCRIPTION_ID_KEY)?,
            auth,
            storage_account: optional(data, STORAGE_ACCOUNT_KEY)?,
        })
    }
}

fn optional(data: &BTreeMap<String, Vec<u8>>, key: &str) -> Result<Option<String>> {
    let Some(raw) = data.get(key) else {
        return Ok(None);
    };
    let value = String::from_utf8(raw.clone())
        .map_err(|_| CloudError::Config(format!("secret key {key} is not valid UTF-8")))?;
    let value = value.trim();
    Ok((!value.is_empty()).then(|| value.to_string()))
}

fn required(data: &BTreeMap<String, Vec<u8>>, key: &str) -> Result<String> {
    optional(data, key)?
        .ok_or_else(|| CloudError::Config(format!("secret does not contain {key}")))
}
