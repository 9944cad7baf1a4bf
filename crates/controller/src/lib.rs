#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Azure provider extension library
//!
//! Reconcilers for the Gardener extension resources of the Azure provider:
//! shoot infrastructure, worker pools, bastions, backup buckets and entries,
//! and DNS records. The `runner` module wires them into `kube` controllers.

pub mod backup;
pub mod bastion;
pub mod classify;
pub mod config;
pub mod context;
pub mod crds;
pub mod dnsrecord;
pub mod error;
pub mod infrastructure;
pub mod runner;
pub mod validation;
pub mod worker;

// Re-export commonly used types
pub use config::ControllerConfig;
pub use context::{Context, ReconcileContext};
pub use error::{Error, Result};
