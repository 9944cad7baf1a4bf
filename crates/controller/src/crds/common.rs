//! Types shared by all extension resources.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Reference to a secret holding cloud credentials.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Reference to one key of a secret.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// Kind of the last operation on a resource.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum OperationType {
    Create,
    Reconcile,
    Delete,
    Migrate,
    Restore,
}

/// Outcome of the last operation on a resource.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum OperationState {
    Processing,
    Succeeded,
    Error,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub state: OperationState,
    pub description: String,
    pub progress: i32,
    pub last_update_time: String,
}

impl LastOperation {
    #[must_use]
    pub fn succeeded(operation_type: OperationType, description: impl Into<String>) -> Self {
        Self {
            operation_type,
            state: OperationState::Succeeded,
            description: description.into(),
            progress: 100,
            last_update_time: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[must_use]
    pub fn processing(operation_type: OperationType, description: impl Into<String>) -> Self {
        Self {
            operation_type,
            state: OperationState::Processing,
            description: description.into(),
            progress: 50,
            last_update_time: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[must_use]
    pub fn errored(operation_type: OperationType, description: impl Into<String>) -> Self {
        Self {
            operation_type,
            state: OperationState::Error,
            description: description.into(),
            progress: 50,
            last_update_time: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
    pub last_update_time: String,
}

impl From<&Error> for LastError {
    fn from(err: &Error) -> Self {
        Self {
            description: err.to_string(),
            codes: err.codes().into_iter().map(str::to_string).collect(),
            last_update_time: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Status fields every extension resource has.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// Encoded provider status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<Value>,
    /// Encoded provider state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}
