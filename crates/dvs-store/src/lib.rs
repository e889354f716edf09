//! Store access for virtual-switch tests.
//!
//! A virtual switch exposes several independently indexed databases over a
//! unix socket. This crate wraps them as [`DataStoreHandle`]s, gives the
//! derived-hardware (ASIC) database a captured baseline via [`AsicDb`], and
//! turns keyspace notifications into ordered add/delete lists with
//! [`EventCapture`].

pub mod asic;
pub mod client;
pub mod events;
pub mod fields;
pub mod handle;

pub mod test_util;

pub use asic::{AsicBaseline, AsicDb};
pub use client::{RedisConnector, RedisStore, StoreClient, StoreConnector, StoreId};
pub use events::{CapturedEvents, EventCapture, Notification, Subscription};
pub use fields::{FieldValues, TableRecord};
pub use handle::{DataStoreHandle, KeySnapshot};
