pub mod cluster;
pub mod common;
pub mod extensions;

pub use cluster::{Cluster, ClusterSpec, ClusterView};
pub use common::*;
pub use extensions::*;

/// Finalizer added to every resource reconciled by this extension.
pub const FINALIZER: &str = "extensions.gardener.cloud/azure";
