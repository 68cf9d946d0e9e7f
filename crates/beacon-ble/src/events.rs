//! Subscriber-facing events
//!
//! Subscribers receive typed events over `tokio::sync::broadcast`; any number of
//! subscribers may be registered, including none.

use beacon_core::{BeaconError, Region, RegionStatus, Sighting};

/// Region, ranging, discovery and advertising notifications
#[derive(Debug, Clone)]
pub enum BeaconEvent {
    RegionEntered(Region),
    RegionExited(Region),
    RegionStateDetermined {
        region: Region,
        status: RegionStatus,
    },
    RangingSnapshot {
        region: Region,
        sightings: Vec<Sighting>,
    },
    MonitoringFailed {
        region: Region,
        error: BeaconError,
    },
    RangingFailed {
        region: Region,
        error: BeaconError,
    },
    BeaconsDiscovered {
        region: Region,
        beacons: Vec<Sighting>,
    },
    DiscoveryFailed {
        region: Region,
        error: BeaconError,
    },
    AdvertisingStarted(Result<(), BeaconError>),
    AdvertisingStopped(Option<BeaconError>),
}

impl BeaconEvent {
    /// Region the event concerns, if any
    pub fn region(&self) -> Option<&Region> {
        match self {
            BeaconEvent::RegionEntered(region) | BeaconEvent::RegionExited(region) => Some(region),
            BeaconEvent::RegionStateDetermined { region, .. }
            | BeaconEvent::RangingSnapshot { region, .. }
            | BeaconEvent::MonitoringFailed { region, .. }
            | BeaconEvent::RangingFailed { region, .. }
            | BeaconEvent::BeaconsDiscovered { region, .. }
            | BeaconEvent::DiscoveryFailed { region, .. } => Some(region),
            BeaconEvent::AdvertisingStarted(_) | BeaconEvent::AdvertisingStopped(_) => None,
        }
    }
}

/// Per-connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    ConnectionFailed(BeaconError),
    /// `None` when the disconnect was requested locally
    Disconnected(Option<BeaconError>),
}
