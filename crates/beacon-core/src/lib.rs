//! Beacon Core
//!
//! Synchronous, I/O-free building blocks for working with location beacons:
//!
//! - [`types`] - beacon identities, regions, sightings
//! - [`advertisement`] - decoding raw advertisements into sightings
//! - [`proximity`] - distance and proximity class estimation
//! - [`region`] - per-region enter/exit state machine
//! - [`ranging`] - per-region ranging sessions and snapshots
//! - [`codec`] - configuration characteristic payloads
//! - [`errors`] - the error taxonomy shared by every layer
//!
//! Time-dependent components take explicit [`std::time::Instant`] arguments so the
//! asynchronous layers decide where time comes from.

pub mod advertisement;
pub mod codec;
pub mod config;
pub mod errors;
pub mod proximity;
pub mod ranging;
pub mod region;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use advertisement::{decode_advertisement, RawAdvertisement};
pub use codec::{AdvertisingInterval, Attribute, AttributeValue, BatteryLevel, TxPower};
pub use config::MonitoringConfig;
pub use errors::{BeaconError, BeaconResult, FirmwareUpdateError};
pub use proximity::{Proximity, ProximityEstimate};
pub use ranging::RangingSession;
pub use region::{RegionStateMachine, RegionTransition};
pub use types::{
    BeaconIdentity, HardwareAddress, Region, RegionCriteria, RegionStatus, Sighting,
    VirtualBeacon, DEFAULT_PROXIMITY_UUID,
};
