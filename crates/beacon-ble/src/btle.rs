//! btleplug-backed platform
//!
//! Implements scanning, GATT connections and a scan-based region monitor on top of
//! the first btleplug adapter. Central events are pumped by a background task into
//! the caller's [`PlatformEvent`] channel:
//!
//! - manufacturer data becomes [`PlatformEvent::Advertisement`]
//! - ranged regions get a [`PlatformEvent::RangingUpdate`] every
//!   [`RANGING_INTERVAL`], built from the advertisements seen since the last one
//! - device disconnects are routed to the matching link event stream
//!
//! There is no operating-system region monitor behind this backend. Monitored
//! regions keep the scanner running and their enter/exit transitions are derived
//! from advertisements by the discovery manager.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use beacon_core::advertisement::{decode_manufacturer_data, manufacturer_structure};
use beacon_core::{HardwareAddress, RawAdvertisement, RegionCriteria, RegionStatus, Sighting};

use crate::error::PlatformError;
use crate::platform::{
    LinkEvent, PlatformConnection, PlatformDiscovery, PlatformEvent, PlatformRegionMonitor,
    PlatformResult, ScanFilter,
};

/// How often ranged regions receive a batch
pub const RANGING_INTERVAL: Duration = Duration::from_secs(1);

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

// ----------------------------------------------------------------------------
// Scan Bookkeeping
// ----------------------------------------------------------------------------

/// Everything that needs the scanner running
#[derive(Debug, Default)]
struct ScanState {
    scanning: bool,
    discovery: bool,
    monitored: HashMap<String, RegionCriteria>,
    ranged: HashMap<String, RangedRegion>,
}

#[derive(Debug)]
struct RangedRegion {
    criteria: RegionCriteria,
    batch: Vec<Sighting>,
}

impl ScanState {
    fn needs_scan(&self) -> bool {
        self.discovery || !self.monitored.is_empty() || !self.ranged.is_empty()
    }
}

struct Shared {
    adapter: Adapter,
    peripherals: RwLock<HashMap<HardwareAddress, Peripheral>>,
    scan: Mutex<ScanState>,
    disconnects: broadcast::Sender<HardwareAddress>,
    events: mpsc::UnboundedSender<PlatformEvent>,
}

impl Shared {
    /// Start or stop the adapter scan to match the registrations
    async fn sync_scan(&self, scan: &mut ScanState) -> PlatformResult<()> {
        match (scan.needs_scan(), scan.scanning) {
            (true, false) => {
                // beacons advertise no services, so filtering happens after decoding
                self.adapter.start_scan(BtleScanFilter::default()).await?;
                scan.scanning = true;
                info!("Started BLE scan");
            }
            (false, true) => {
                self.adapter.stop_scan().await?;
                scan.scanning = false;
                info!("Stopped BLE scan");
            }
            _ => {}
        }
        Ok(())
    }

    async fn find_peripheral(&self, address: HardwareAddress) -> PlatformResult<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().await.get(&address) {
            return Ok(peripheral.clone());
        }

        for peripheral in self.adapter.peripherals().await? {
            if HardwareAddress::new(peripheral.address().into_inner()) == address {
                self.peripherals
                    .write()
                    .await
                    .insert(address, peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(PlatformError::PeripheralNotFound {
            address: address.to_string(),
        })
    }

    async fn find_characteristic(
        &self,
        address: HardwareAddress,
        uuid: Uuid,
    ) -> PlatformResult<(Peripheral, Characteristic)> {
        let peripheral = self.find_peripheral(address).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| PlatformError::CharacteristicNotFound {
                characteristic: uuid.to_string(),
            })?;
        Ok((peripheral, characteristic))
    }

    // ------------------------------------------------------------------------
    // Central Events
    // ------------------------------------------------------------------------

    async fn on_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } => {
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    return;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    return;
                };
                let address = HardwareAddress::new(properties.address.into_inner());
                // a missing reading is reported as zero, which estimates as unknown proximity
                let rssi = properties.rssi.unwrap_or(0);

                self.peripherals
                    .write()
                    .await
                    .entry(address)
                    .or_insert(peripheral);

                for (company_id, data) in manufacturer_data {
                    self.collect_ranging(company_id, &data, address, rssi).await;
                    let _ = self.events.send(PlatformEvent::Advertisement(RawAdvertisement {
                        address,
                        payload: manufacturer_structure(company_id, &data),
                        rssi,
                    }));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = self
                    .peripherals
                    .read()
                    .await
                    .iter()
                    .find(|(_, peripheral)| peripheral.id() == id)
                    .map(|(address, _)| *address);
                if let Some(address) = address {
                    debug!("Peripheral {} disconnected", address);
                    let _ = self.disconnects.send(address);
                }
            }
            _ => {}
        }
    }

    async fn collect_ranging(
        &self,
        company_id: u16,
        data: &[u8],
        address: HardwareAddress,
        rssi: i16,
    ) {
        let mut scan = self.scan.lock().await;
        if scan.ranged.is_empty() {
            return;
        }
        let sighting = match decode_manufacturer_data(company_id, data, address, rssi, Instant::now()) {
            Ok(sighting) => sighting,
            Err(e) => {
                trace!("Not ranging advertisement from {}: {}", address, e);
                return;
            }
        };
        for ranged in scan.ranged.values_mut() {
            if ranged.criteria.matches(&sighting.identity) {
                ranged.batch.push(sighting.clone());
            }
        }
    }

    async fn flush_ranging(&self) {
        let mut scan = self.scan.lock().await;
        for (region_id, ranged) in scan.ranged.iter_mut() {
            let sightings = std::mem::take(&mut ranged.batch);
            let _ = self.events.send(PlatformEvent::RangingUpdate {
                region_id: region_id.clone(),
                sightings,
            });
        }
    }
}

async fn pump(shared: Arc<Shared>, mut central: CentralEvents) {
    let mut flush = tokio::time::interval(RANGING_INTERVAL);
    loop {
        tokio::select! {
            event = central.next() => match event {
                Some(event) => shared.on_central_event(event).await,
                None => {
                    warn!("BLE adapter event stream ended");
                    let mut scan = shared.scan.lock().await;
                    if scan.discovery {
                        let _ = shared.events.send(PlatformEvent::ScanFailed {
                            error: PlatformError::AdapterNotAvailable,
                        });
                    }
                    for (region_id, _) in scan.monitored.drain() {
                        let _ = shared.events.send(PlatformEvent::MonitoringFailed {
                            region_id,
                            error: PlatformError::AdapterNotAvailable,
                        });
                    }
                    for (region_id, _) in scan.ranged.drain() {
                        let _ = shared.events.send(PlatformEvent::RangingFailed {
                            region_id,
                            error: PlatformError::AdapterNotAvailable,
                        });
                    }
                    scan.discovery = false;
                    scan.scanning = false;
                    break;
                }
            },
            _ = flush.tick() => shared.flush_ranging().await,
        }
        if shared.events.is_closed() {
            debug!("Platform event receiver dropped, stopping BLE event pump");
            break;
        }
    }
}

// ----------------------------------------------------------------------------
// Platform
// ----------------------------------------------------------------------------

pub struct BtleplugPlatform {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl BtleplugPlatform {
    /// Open the first BLE adapter and start forwarding its events to `events`
    pub async fn new(events: mpsc::UnboundedSender<PlatformEvent>) -> PlatformResult<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(PlatformError::AdapterNotAvailable)?;
        info!(
            "Using BLE adapter {}",
            adapter.adapter_info().await.unwrap_or_default()
        );

        let central = adapter.events().await?;
        let (disconnects, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            adapter,
            peripherals: RwLock::new(HashMap::new()),
            scan: Mutex::new(ScanState::default()),
            disconnects,
            events,
        });
        let pump = tokio::spawn(pump(shared.clone(), central));

        Ok(Self { shared, pump })
    }
}

impl Drop for BtleplugPlatform {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl PlatformDiscovery for BtleplugPlatform {
    async fn start_scan(&self, _filter: ScanFilter) -> PlatformResult<()> {
        let mut scan = self.shared.scan.lock().await;
        scan.discovery = true;
        if let Err(e) = self.shared.sync_scan(&mut scan).await {
            scan.discovery = false;
            error!("Failed to start BLE scan: {}", e);
            return Err(e);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> PlatformResult<()> {
        let mut scan = self.shared.scan.lock().await;
        scan.discovery = false;
        self.shared.sync_scan(&mut scan).await
    }
}

#[async_trait]
impl PlatformRegionMonitor for BtleplugPlatform {
    async fn start_monitoring(
        &self,
        region_id: &str,
        criteria: &RegionCriteria,
    ) -> PlatformResult<()> {
        let mut scan = self.shared.scan.lock().await;
        scan.monitored.insert(region_id.to_string(), *criteria);
        if let Err(e) = self.shared.sync_scan(&mut scan).await {
            scan.monitored.remove(region_id);
            return Err(e);
        }
        Ok(())
    }

    async fn stop_monitoring(&self, region_id: &str) -> PlatformResult<()> {
        let mut scan = self.shared.scan.lock().await;
        scan.monitored.remove(region_id);
        self.shared.sync_scan(&mut scan).await
    }

    async fn start_ranging(&self, region_id: &str, criteria: &RegionCriteria) -> PlatformResult<()> {
        let mut scan = self.shared.scan.lock().await;
        scan.ranged.insert(
            region_id.to_string(),
            RangedRegion {
                criteria: *criteria,
                batch: Vec::new(),
            },
        );
        if let Err(e) = self.shared.sync_scan(&mut scan).await {
            scan.ranged.remove(region_id);
            return Err(e);
        }
        Ok(())
    }

    async fn stop_ranging(&self, region_id: &str) -> PlatformResult<()> {
        let mut scan = self.shared.scan.lock().await;
        scan.ranged.remove(region_id);
        self.shared.sync_scan(&mut scan).await
    }

    /// The scanner keeps no region state of its own, so the answer is always unknown
    async fn request_state(&self, region_id: &str) -> PlatformResult<()> {
        let _ = self.shared.events.send(PlatformEvent::RegionStateDetermined {
            region_id: region_id.to_string(),
            status: RegionStatus::Unknown,
        });
        Ok(())
    }
}

#[async_trait]
impl PlatformConnection for BtleplugPlatform {
    async fn link_events(
        &self,
        address: HardwareAddress,
    ) -> PlatformResult<BoxStream<'static, LinkEvent>> {
        let disconnects = self.shared.disconnects.subscribe();
        let link = stream::unfold(disconnects, move |mut disconnects| async move {
            loop {
                match disconnects.recv().await {
                    Ok(dropped) if dropped == address => {
                        return Some((LinkEvent::Disconnected { error: None }, disconnects));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(link.boxed())
    }

    async fn connect(&self, address: HardwareAddress) -> PlatformResult<()> {
        let peripheral = self.shared.find_peripheral(address).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;
        debug!("Discovered services on {}", address);
        Ok(())
    }

    async fn disconnect(&self, address: HardwareAddress) -> PlatformResult<()> {
        let peripheral = self.shared.find_peripheral(address).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: HardwareAddress,
        characteristic: Uuid,
    ) -> PlatformResult<Vec<u8>> {
        let (peripheral, characteristic) =
            self.shared.find_characteristic(address, characteristic).await?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write_characteristic(
        &self,
        address: HardwareAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> PlatformResult<()> {
        let (peripheral, characteristic) =
            self.shared.find_characteristic(address, characteristic).await?;
        peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }
}
