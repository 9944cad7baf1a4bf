//! Errors of the cloud clients.

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while talking to Azure.
#[derive(Error, Debug)]
pub enum CloudError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} {code}: {message}", code = .code.as_deref().unwrap_or("-"))]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Resource not found where one was required.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A long-running operation did not finish in time.
    #[error("Operation on {id} timed out after {seconds} seconds")]
    Timeout { id: String, seconds: u64 },

    /// A long-running operation ended in a failed state.
    #[error("Operation on {id} ended in state {state}")]
    OperationFailed { id: String, state: String },

    /// Invalid configuration or credentials.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed blob service response.
    #[error("Invalid blob service response: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl CloudError {
    /// Returns `true` for 404 responses and explicit not-found errors.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Api { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// ARM error code, e.g. `ResourceGroupNotFound`.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Builds an API error from a response body, extracting the ARM error
    /// envelope when present.
    pub(crate) fn from_response(status: u16, body: String) -> Self {
        #[derive(Deserialize)]
        struct Envelope {
            error: Detail,
        }
        #[derive(Deserialize)]
        struct Detail {
            code: Option<String>,
            message: Option<String>,
        }

        match serde_json::from_str::<Envelope>(&body) {
            Ok(Envelope { error }) => Self::Api {
                status,
                code: error.code,
                message: error.message.unwrap_or(body),
            },
            Err(_) => Self::Api {
                status,
                code: None,
                message: body,
            },
        }
    }
}

/// Result alias for this crate.
pub type Result<T, E = CloudError> = std::result::Result<T, E>;
