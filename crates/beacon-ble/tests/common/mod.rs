//! In-memory platform collaborators for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use uuid::Uuid;

use beacon_ble::platform::PlatformResult;
use beacon_ble::{
    LinkEvent, PlatformAdvertiser, PlatformConnection, PlatformDiscovery, PlatformError,
    PlatformRegionMonitor, ScanFilter,
};
use beacon_core::codec::{
    BATTERY_CHARACTERISTIC_UUID, FIRMWARE_VERSION_CHARACTERISTIC_UUID,
    FREQUENCY_CHARACTERISTIC_UUID, HARDWARE_VERSION_CHARACTERISTIC_UUID,
    MAJOR_CHARACTERISTIC_UUID, MINOR_CHARACTERISTIC_UUID, POWER_CHARACTERISTIC_UUID,
};
use beacon_core::{
    BeaconIdentity, HardwareAddress, RegionCriteria, TxPower, VirtualBeacon,
    DEFAULT_PROXIMITY_UUID,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn identity() -> BeaconIdentity {
    BeaconIdentity::new(
        DEFAULT_PROXIMITY_UUID,
        1,
        5,
        HardwareAddress::new([0xD0, 0x1F, 0x02, 0x3A, 0x4B, 0x5C]),
    )
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// Scripted answer for the next read of a characteristic
#[derive(Debug, Clone)]
pub enum ReadScript {
    Value(Vec<u8>),
    Fail(PlatformError),
    /// Never complete
    Hang,
}

/// Characteristic store with instrumentation
pub struct MockConnection {
    registers: Mutex<HashMap<Uuid, Vec<u8>>>,
    scripts: Mutex<HashMap<Uuid, VecDeque<ReadScript>>>,
    write_failures: Mutex<HashMap<Uuid, PlatformError>>,
    connect_failure: Mutex<Option<PlatformError>>,
    connect_hangs: AtomicBool,
    /// Peripheral drops the link just as connect completes
    drop_on_connect: AtomicBool,
    link: broadcast::Sender<LinkEvent>,
    /// Every characteristic operation in dispatch order
    log: Mutex<Vec<(String, Uuid)>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    op_delay: Duration,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::from_millis(10))
    }

    pub fn with_delay(op_delay: Duration) -> Arc<Self> {
        let (link, _) = broadcast::channel(8);
        let mock = Self {
            registers: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            write_failures: Mutex::new(HashMap::new()),
            connect_failure: Mutex::new(None),
            connect_hangs: AtomicBool::new(false),
            drop_on_connect: AtomicBool::new(false),
            link,
            log: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            op_delay,
        };
        mock.load_factory_settings();
        Arc::new(mock)
    }

    fn load_factory_settings(&self) {
        let mut registers = self.registers.lock().unwrap();
        registers.insert(MAJOR_CHARACTERISTIC_UUID, vec![0x00, 0x01]);
        registers.insert(MINOR_CHARACTERISTIC_UUID, vec![0x00, 0x05]);
        registers.insert(POWER_CHARACTERISTIC_UUID, vec![TxPower::Minus12.dbm() as u8]);
        registers.insert(FREQUENCY_CHARACTERISTIC_UUID, vec![95]);
        registers.insert(BATTERY_CHARACTERISTIC_UUID, vec![80]);
        registers.insert(HARDWARE_VERSION_CHARACTERISTIC_UUID, b"D3.4\0".to_vec());
        registers.insert(FIRMWARE_VERSION_CHARACTERISTIC_UUID, b"A2.1\0".to_vec());
    }

    pub fn set_register(&self, characteristic: Uuid, value: Vec<u8>) {
        self.registers.lock().unwrap().insert(characteristic, value);
    }

    pub fn script_read(&self, characteristic: Uuid, script: ReadScript) {
        self.scripts
            .lock()
            .unwrap()
            .entry(characteristic)
            .or_default()
            .push_back(script);
    }

    pub fn fail_writes(&self, characteristic: Uuid, error: PlatformError) {
        self.write_failures.lock().unwrap().insert(characteristic, error);
    }

    pub fn fail_connect(&self, error: PlatformError) {
        *self.connect_failure.lock().unwrap() = Some(error);
    }

    /// Connect attempts never complete
    pub fn hang_connect(&self) {
        self.connect_hangs.store(true, Ordering::SeqCst);
    }

    pub fn drop_link_on_connect(&self) {
        self.drop_on_connect.store(true, Ordering::SeqCst);
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self, error: Option<PlatformError>) {
        let _ = self.link.send(LinkEvent::Disconnected { error });
    }

    pub fn log(&self) -> Vec<(String, Uuid)> {
        self.log.lock().unwrap().clone()
    }

    pub fn reads(&self) -> Vec<Uuid> {
        self.log()
            .into_iter()
            .filter(|(op, _)| op == "read")
            .map(|(_, uuid)| uuid)
            .collect()
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, op: &str, characteristic: Uuid) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push((op.to_string(), characteristic));
        InFlightGuard(&self.in_flight)
    }
}

#[async_trait]
impl PlatformConnection for MockConnection {
    async fn link_events(
        &self,
        _address: HardwareAddress,
    ) -> PlatformResult<BoxStream<'static, LinkEvent>> {
        let rx = self.link.subscribe();
        let events = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(events.boxed())
    }

    async fn connect(&self, _address: HardwareAddress) -> PlatformResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.op_delay).await;
        if self.connect_hangs.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if let Some(error) = self.connect_failure.lock().unwrap().clone() {
            return Err(error);
        }
        if self.drop_on_connect.load(Ordering::SeqCst) {
            self.drop_link(None);
        }
        Ok(())
    }

    async fn disconnect(&self, _address: HardwareAddress) -> PlatformResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_characteristic(
        &self,
        _address: HardwareAddress,
        characteristic: Uuid,
    ) -> PlatformResult<Vec<u8>> {
        let _guard = self.enter("read", characteristic);
        tokio::time::sleep(self.op_delay).await;

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&characteristic)
            .and_then(|queue| queue.pop_front());
        match script {
            Some(ReadScript::Value(value)) => Ok(value),
            Some(ReadScript::Fail(error)) => Err(error),
            Some(ReadScript::Hang) => futures::future::pending().await,
            None => self
                .registers
                .lock()
                .unwrap()
                .get(&characteristic)
                .cloned()
                .ok_or(PlatformError::CharacteristicNotFound {
                    characteristic: characteristic.to_string(),
                }),
        }
    }

    async fn write_characteristic(
        &self,
        _address: HardwareAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> PlatformResult<()> {
        let _guard = self.enter("write", characteristic);
        tokio::time::sleep(self.op_delay).await;

        if let Some(error) = self.write_failures.lock().unwrap().get(&characteristic) {
            return Err(error.clone());
        }
        self.writes
            .lock()
            .unwrap()
            .push((characteristic, value.to_vec()));
        self.registers
            .lock()
            .unwrap()
            .insert(characteristic, value.to_vec());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Discovery, Monitoring and Advertising
// ----------------------------------------------------------------------------

/// Records every scan and region request
#[derive(Default)]
pub struct MockMonitor {
    calls: Mutex<Vec<String>>,
    refuse: Mutex<Option<PlatformError>>,
    hang: AtomicBool,
}

impl MockMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following request fail
    pub fn refuse(&self, error: PlatformError) {
        *self.refuse.lock().unwrap() = Some(error);
    }

    /// Make every following request stall forever
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, call: String) -> PlatformResult<()> {
        self.calls.lock().unwrap().push(call);
        if self.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        match self.refuse.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformDiscovery for MockMonitor {
    async fn start_scan(&self, filter: ScanFilter) -> PlatformResult<()> {
        self.record(format!("start_scan {}", filter.proximity_uuids.len()))
            .await
    }

    async fn stop_scan(&self) -> PlatformResult<()> {
        self.record("stop_scan".to_string()).await
    }
}

#[async_trait]
impl PlatformRegionMonitor for MockMonitor {
    async fn start_monitoring(
        &self,
        region_id: &str,
        _criteria: &RegionCriteria,
    ) -> PlatformResult<()> {
        self.record(format!("start_monitoring {}", region_id)).await
    }

    async fn stop_monitoring(&self, region_id: &str) -> PlatformResult<()> {
        self.record(format!("stop_monitoring {}", region_id)).await
    }

    async fn start_ranging(&self, region_id: &str, _criteria: &RegionCriteria) -> PlatformResult<()> {
        self.record(format!("start_ranging {}", region_id)).await
    }

    async fn stop_ranging(&self, region_id: &str) -> PlatformResult<()> {
        self.record(format!("stop_ranging {}", region_id)).await
    }

    async fn request_state(&self, region_id: &str) -> PlatformResult<()> {
        self.record(format!("request_state {}", region_id)).await
    }
}

#[derive(Default)]
pub struct AdvertiserState {
    pub advertising: Mutex<Option<(VirtualBeacon, TxPower)>>,
    pub failure: Mutex<Option<PlatformError>>,
    /// Requests never complete while set
    pub hang: AtomicBool,
}

pub struct MockAdvertiser {
    state: Arc<AdvertiserState>,
}

impl MockAdvertiser {
    pub fn new() -> (Self, Arc<AdvertiserState>) {
        let state = Arc::new(AdvertiserState::default());
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

#[async_trait]
impl PlatformAdvertiser for MockAdvertiser {
    async fn start_advertising(
        &mut self,
        beacon: &VirtualBeacon,
        tx_power: TxPower,
    ) -> PlatformResult<()> {
        if self.state.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if let Some(error) = self.state.failure.lock().unwrap().clone() {
            return Err(error);
        }
        *self.state.advertising.lock().unwrap() = Some((beacon.clone(), tx_power));
        Ok(())
    }

    async fn stop_advertising(&mut self) -> PlatformResult<()> {
        *self.state.advertising.lock().unwrap() = None;
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.state.advertising.lock().unwrap().is_some()
    }
}
