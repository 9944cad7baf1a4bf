//! Internal, version-independent form of the provider API.
//!
//! Reconcilers only ever see these types. The serialized form lives in
//! [`crate::v1alpha1`]; leaf types whose wire shape equals their internal
//! shape are defined here once and re-exported there.

mod backup;
mod cloud;
mod cloudprofile;
mod controlplane;
mod infrastructure;
mod worker;

pub use backup::{BackupBucketConfig, ImmutableConfig, RetentionType};
pub use cloud::{CloudConfiguration, CloudName};
pub use cloudprofile::{
    Capabilities, CapabilityDefinition, CloudProfileConfig, DomainCount, FlavorKind, ImageFlavor,
    ImageReference, MachineImageVersion, MachineImages, MachineType,
};
pub use controlplane::{CloudControllerManagerConfig, ControlPlaneConfig, StorageConfig};
pub use infrastructure::{
    AvailabilitySet, AzureResource, IdentityConfig, IdentityStatus, InfrastructureConfig,
    InfrastructureState, InfrastructureStatus, NatGatewayConfig, NetworkConfig, NetworkLayout,
    NetworkStatus, PublicIpReference, Purpose, RouteTable, SecurityGroup, Subnet, VnetConfig,
    VnetStatus, ZoneConfig, ZonedNatGatewayConfig,
};
pub use worker::{
    CachingType, CapacityReservation, DataVolume, DiagnosticsProfile, MachineImage, NodeTemplate,
    OsDisk, VmoDependency, WorkerConfig, WorkerStatus,
};
