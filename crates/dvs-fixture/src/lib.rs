//! Virtual-switch test fixtures.
//!
//! - [`DeviceInstance`]: one switch container, its namespace holder and
//!   per-port [`dvs_net::VirtualServer`]s, gated on readiness
//! - [`FixtureManager`]: the session-wide instance handed to test modules
//! - [`TopologyController`]: several switches wired together from a
//!   topology document, with ping and log verification

pub mod device;
pub mod docker;
pub mod fixture;
pub mod topology;

pub use device::{DeviceInstance, DeviceSpec, DeviceState};
pub use docker::{ContainerRuntime, ContainerSpec};
pub use fixture::FixtureManager;
pub use topology::{TopologyController, TopologyDescriptor, VerificationReport};
