//! Linux beacon advertising using bluer (BlueZ)

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info};

use beacon_core::advertisement::{encode_manufacturer_data, APPLE_COMPANY_ID};
use beacon_core::{TxPower, VirtualBeacon};

use crate::error::PlatformError;
use crate::platform::{PlatformAdvertiser, PlatformResult};

// ----------------------------------------------------------------------------
// Linux Implementation
// ----------------------------------------------------------------------------

pub struct LinuxAdvertiser {
    session: Option<bluer::Session>,
    adapter: Option<bluer::Adapter>,
    /// Advertising stops when the handle is dropped
    handle: Option<bluer::adv::AdvertisementHandle>,
}

impl LinuxAdvertiser {
    pub fn new() -> Self {
        Self {
            session: None,
            adapter: None,
            handle: None,
        }
    }

    async fn adapter(&mut self) -> PlatformResult<&bluer::Adapter> {
        if self.adapter.is_none() {
            let session = bluer::Session::new()
                .await
                .map_err(|e| PlatformError::Failure(format!("BlueZ session: {}", e)))?;
            let adapter = session
                .default_adapter()
                .await
                .map_err(|_| PlatformError::AdapterNotAvailable)?;

            if !adapter.is_powered().await.unwrap_or(false) {
                return Err(PlatformError::PoweredOff);
            }

            info!("BlueZ adapter {} initialized for advertising", adapter.name());
            self.session = Some(session);
            self.adapter = Some(adapter);
        }
        self.adapter.as_ref().ok_or(PlatformError::AdapterNotAvailable)
    }
}

impl Default for LinuxAdvertiser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformAdvertiser for LinuxAdvertiser {
    async fn start_advertising(
        &mut self,
        beacon: &VirtualBeacon,
        tx_power: TxPower,
    ) -> PlatformResult<()> {
        // replace any running broadcast
        self.handle = None;

        let mut manufacturer_data = BTreeMap::new();
        manufacturer_data.insert(APPLE_COMPANY_ID, encode_manufacturer_data(beacon));

        let advertisement = bluer::adv::Advertisement {
            advertisement_type: bluer::adv::Type::Broadcast,
            manufacturer_data,
            tx_power: Some(tx_power.dbm() as i16),
            ..Default::default()
        };

        let adapter = self.adapter().await?;
        let handle = adapter
            .advertise(advertisement)
            .await
            .map_err(|e| PlatformError::Failure(format!("advertise: {}", e)))?;

        debug!(
            "Broadcasting {} major={} minor={} at {}",
            beacon.proximity_uuid, beacon.major, beacon.minor, tx_power
        );
        self.handle = Some(handle);
        info!("Started advertising virtual beacon '{}'", beacon.identifier);
        Ok(())
    }

    async fn stop_advertising(&mut self) -> PlatformResult<()> {
        if self.handle.take().is_some() {
            info!("Stopped beacon advertising");
        }
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.handle.is_some()
    }
}
