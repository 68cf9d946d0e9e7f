//! Platform collaborator interfaces
//!
//! The physical BLE stack and the operating system's region monitor are consumed
//! through the narrow traits below. Requests are async methods; unsolicited
//! callbacks (advertisements, region changes, ranging batches, link loss) are
//! delivered as typed events on a channel owned by the caller.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use beacon_core::{
    HardwareAddress, RawAdvertisement, RegionCriteria, RegionStatus, Sighting, TxPower,
    VirtualBeacon,
};

use crate::error::PlatformError;

pub type PlatformResult<T> = Result<T, PlatformError>;

// ----------------------------------------------------------------------------
// Platform Events
// ----------------------------------------------------------------------------

/// Unsolicited callbacks delivered by the scanner, region monitor and advertiser
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    Advertisement(RawAdvertisement),
    ScanFailed { error: PlatformError },
    RegionEntered { region_id: String },
    RegionExited { region_id: String },
    RegionStateDetermined { region_id: String, status: RegionStatus },
    RangingUpdate { region_id: String, sightings: Vec<Sighting> },
    MonitoringFailed { region_id: String, error: PlatformError },
    RangingFailed { region_id: String, error: PlatformError },
    /// Advertising stopped without being asked to, e.g. the radio was powered off
    AdvertisingStopped { error: Option<PlatformError> },
}

/// Link-level notifications for one connected peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected { error: Option<PlatformError> },
}

/// Scan parameters handed to the platform scanner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Proximity UUIDs of interest; empty means every beacon
    pub proximity_uuids: Vec<Uuid>,
}

// ----------------------------------------------------------------------------
// Collaborator Traits
// ----------------------------------------------------------------------------

/// Advertisement scanning
#[async_trait]
pub trait PlatformDiscovery: Send + Sync {
    async fn start_scan(&self, filter: ScanFilter) -> PlatformResult<()>;

    async fn stop_scan(&self) -> PlatformResult<()>;
}

/// Operating-system region monitoring and ranging
#[async_trait]
pub trait PlatformRegionMonitor: Send + Sync {
    async fn start_monitoring(&self, region_id: &str, criteria: &RegionCriteria)
        -> PlatformResult<()>;

    async fn stop_monitoring(&self, region_id: &str) -> PlatformResult<()>;

    async fn start_ranging(&self, region_id: &str, criteria: &RegionCriteria) -> PlatformResult<()>;

    async fn stop_ranging(&self, region_id: &str) -> PlatformResult<()>;

    /// Ask for a `RegionStateDetermined` event for a monitored region
    async fn request_state(&self, region_id: &str) -> PlatformResult<()>;
}

/// GATT connection and characteristic I/O
///
/// Implementations need not support concurrent operations on one peripheral; the
/// connection engine never issues more than one at a time.
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    /// Link events for `address`; must be obtainable before `connect`
    async fn link_events(
        &self,
        address: HardwareAddress,
    ) -> PlatformResult<BoxStream<'static, LinkEvent>>;

    async fn connect(&self, address: HardwareAddress) -> PlatformResult<()>;

    async fn disconnect(&self, address: HardwareAddress) -> PlatformResult<()>;

    async fn read_characteristic(
        &self,
        address: HardwareAddress,
        characteristic: Uuid,
    ) -> PlatformResult<Vec<u8>>;

    async fn write_characteristic(
        &self,
        address: HardwareAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> PlatformResult<()>;
}

/// Broadcasting the local device as a beacon
#[async_trait]
pub trait PlatformAdvertiser: Send + Sync {
    /// Resolves once the platform confirms advertising started
    async fn start_advertising(
        &mut self,
        beacon: &VirtualBeacon,
        tx_power: TxPower,
    ) -> PlatformResult<()>;

    async fn stop_advertising(&mut self) -> PlatformResult<()>;

    fn is_advertising(&self) -> bool;
}
