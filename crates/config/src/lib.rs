//! Provider-specific API of the Azure extension.
//!
//! The orchestrator hands every extension resource an opaque
//! `providerConfig` payload. This crate owns everything needed to turn those
//! bytes into typed values and back:
//!
//! - [`api`] - the internal, version-independent types the reconcilers work with
//! - [`v1alpha1`] - the serialized wire form and its conversions
//! - [`scheme`] - the `(group, version, kind)` registry with strict and lenient decoders
//! - [`transform`] - legacy ↔ capability normalization of cloud profile images
//! - [`helper`] - pure lookups over decoded configuration

pub mod api;
pub mod error;
pub mod helper;
pub mod scheme;
pub mod transform;
pub mod v1alpha1;

pub use error::{Error, Result};

/// API group of all provider-specific kinds.
pub const GROUP_NAME: &str = "azure.provider.extensions.gardener.cloud";

/// Default CPU architecture when a pool or image does not declare one.
pub const ARCHITECTURE_AMD64: &str = "amd64";

/// Name of the `architecture` capability.
pub const CAPABILITY_ARCHITECTURE: &str = "architecture";

/// Name of the `network` capability.
pub const CAPABILITY_NETWORK: &str = "network";

/// Value of the `network` capability for accelerated networking.
pub const NETWORK_ACCELERATED: &str = "accelerated";

/// Value of the `network` capability for basic networking.
pub const NETWORK_BASIC: &str = "basic";
