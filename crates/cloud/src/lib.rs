//! Azure clients for the provider extension.
//!
//! - [`transport`]: Resource Manager access by resource ID, over HTTPS or
//!   in memory
//! - [`clients`]: typed per-kind clients and resource IDs
//! - [`factory`]: builds clients from a credential secret and cloud instance
//! - [`blob`]: blob data plane used for backup cleanup
//!
//! Long-running operations are awaited inside the transport, so a returned
//! object is always provisioned. Dropping a future aborts its request.

pub mod blob;
pub mod clients;
pub mod credentials;
pub mod endpoints;
pub mod error;
pub mod factory;
pub mod resources;
pub mod tags;
pub mod token;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clients::{ResourceClient, ResourceId};
pub use credentials::Credentials;
pub use endpoints::CloudEndpoints;
pub use error::{CloudError, Result};
pub use factory::ClientFactory;
pub use resources::ArmResource;
pub use transport::ArmTransport;
