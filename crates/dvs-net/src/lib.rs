//! Linux network plumbing for virtual-switch test fixtures.
//!
//! Provides network namespace management, veth link wiring into container
//! namespaces, the per-port [`VirtualServer`] peer endpoint, interface
//! inventory/cleanup helpers and ping probe parsing.

pub mod iface;
pub mod link;
pub mod namespace;
pub mod ping;
pub mod server;

pub use link::NetScope;
pub use namespace::Namespace;
pub use ping::PingReport;
pub use server::{Provision, VirtualServer};
