//! Errors raised while decoding or inspecting provider configuration.

use thiserror::Error;

/// Errors produced by the typed configuration layer.
#[derive(Error, Debug)]
pub enum Error {
    /// The payload is not valid JSON for the expected shape.
    #[error("failed to parse provider payload: {0}")]
    Parse(#[from] serde_json::Error),

    /// The payload has no content.
    #[error("provider payload is empty")]
    Empty,

    /// `apiVersion` or `kind` is missing from the payload.
    #[error("provider payload is missing {0}")]
    MissingTypeMeta(&'static str),

    /// No decoder is registered for the payload's group-version-kind.
    #[error("no kind {kind:?} is registered for version {api_version:?}")]
    UnknownKind { api_version: String, kind: String },

    /// The payload declares a kind other than the requested one.
    #[error("expected kind {expected}, got {actual}")]
    KindMismatch {
        expected: &'static str,
        actual: String,
    },

    /// Strict decoding found fields the target type does not know.
    #[error("strict decoding error: unknown field(s) {}", .0.join(", "))]
    UnknownFields(Vec<String>),

    /// A wire value could not be converted to its internal form.
    #[error("invalid {field}: {reason}")]
    Conversion { field: String, reason: String },

    /// A lookup did not find the requested item.
    #[error("{0}")]
    NotFound(String),
}

impl From<std::convert::Infallible> for Error {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

impl Error {
    pub(crate) fn conversion(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conversion {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for lookup misses.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
