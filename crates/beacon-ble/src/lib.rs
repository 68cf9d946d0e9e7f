//! Beacon BLE
//!
//! Asynchronous orchestration for location beacons on top of the pure logic in
//! `beacon-core`:
//!
//! - [`DiscoveryManager`] - region monitoring, ranging, scan discovery and virtual
//!   beacon advertising, fanned out to subscribers as [`BeaconEvent`]s
//! - [`BeaconHandle`] - a connection to one beacon with a serialized, time-bounded
//!   transaction queue for configuration reads, writes and firmware updates
//! - [`BeaconRegistry`] - hands out those handles, one engine per address
//! - [`platform`] - the narrow traits the platform Bluetooth stack is consumed
//!   through
//! - [`btle`] and [`advertising`] - btleplug and BlueZ implementations of those
//!   traits

pub mod advertising;
pub mod beacon;
pub mod btle;
pub mod config;
pub mod discovery;
mod engine;
pub mod error;
pub mod events;
pub mod firmware;
pub mod platform;
pub mod registry;
pub mod router;
pub mod transaction;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use advertising::default_advertiser;
pub use beacon::{BeaconHandle, BeaconSettings, ConnectionState};
pub use btle::BtleplugPlatform;
pub use config::{ConnectionConfig, DiscoveryConfig, WritePolicies, WritePolicy};
pub use discovery::{DiscoveryManager, PlatformServices};
pub use error::PlatformError;
pub use events::{BeaconEvent, ConnectionEvent};
pub use firmware::{
    FirmwareOutcome, FirmwareProgress, FirmwareRelease, FirmwareSource, FirmwareStage,
    FirmwareState, FirmwareUpdate,
};
pub use platform::{
    LinkEvent, PlatformAdvertiser, PlatformConnection, PlatformDiscovery, PlatformEvent,
    PlatformRegionMonitor, ScanFilter,
};
pub use registry::BeaconRegistry;
pub use router::RegionRouter;
pub use transaction::{Pending, TransactionKind, WriteAck};
