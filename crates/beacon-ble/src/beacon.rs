//! Connectable beacon handle

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use beacon_core::codec::{Attribute, AttributeValue};
use beacon_core::{
    AdvertisingInterval, BatteryLevel, BeaconError, BeaconIdentity, BeaconResult, TxPower,
};

use crate::config::ConnectionConfig;
use crate::engine::{ConnectionEngine, EngineCommand};
use crate::events::ConnectionEvent;
use crate::firmware::{FirmwareSource, FirmwareState, FirmwareUpdate};
use crate::platform::PlatformConnection;
use crate::transaction::{Pending, Request, TransactionContext, WriteAck};

/// Capacity of the per-connection event channel
const CONNECTION_EVENT_BUFFER: usize = 16;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

// ----------------------------------------------------------------------------
// Settings Snapshot
// ----------------------------------------------------------------------------

/// Last known configuration of a beacon
///
/// Fields are filled in by successful reads and verified writes only; `None` means
/// the value has not been read on any connection yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconSettings {
    pub major: Option<u16>,
    pub minor: Option<u16>,
    pub power: Option<TxPower>,
    pub frequency: Option<AdvertisingInterval>,
    pub battery: Option<BatteryLevel>,
    pub hardware_version: Option<String>,
    pub firmware_version: Option<String>,
    pub firmware_state: FirmwareState,
}

impl BeaconSettings {
    pub(crate) fn apply(&mut self, value: &AttributeValue) {
        match value {
            AttributeValue::Major(v) => self.major = Some(*v),
            AttributeValue::Minor(v) => self.minor = Some(*v),
            AttributeValue::Power(p) => self.power = Some(*p),
            AttributeValue::Frequency(i) => self.frequency = Some(*i),
            AttributeValue::Battery(b) => self.battery = Some(*b),
            AttributeValue::HardwareVersion(s) => self.hardware_version = Some(s.clone()),
            AttributeValue::FirmwareVersion(s) => self.firmware_version = Some(s.clone()),
        }
    }
}

// ----------------------------------------------------------------------------
// Beacon Handle
// ----------------------------------------------------------------------------

/// Handle to one connectable beacon
///
/// Cloning is cheap; every clone talks to the same connection engine. The engine
/// disconnects and stops once the last clone is dropped.
#[derive(Clone)]
pub struct BeaconHandle {
    identity: BeaconIdentity,
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<ConnectionState>,
    settings: watch::Receiver<BeaconSettings>,
    events: broadcast::Sender<ConnectionEvent>,
    pending: Arc<AtomicUsize>,
}

impl BeaconHandle {
    /// Spawn the connection engine for `identity` on the current runtime
    ///
    /// Callers outside the crate go through [`BeaconRegistry`](crate::BeaconRegistry)
    /// so that one address never has two engines.
    pub(crate) fn spawn(
        identity: BeaconIdentity,
        platform: Arc<dyn PlatformConnection>,
        config: ConnectionConfig,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (settings_tx, settings_rx) = watch::channel(BeaconSettings::default());
        let (event_tx, _) = broadcast::channel(CONNECTION_EVENT_BUFFER);
        let pending = Arc::new(AtomicUsize::new(0));

        let ctx = TransactionContext {
            platform,
            address: identity.address,
            timeout: config.transaction_timeout,
            settings: Arc::new(settings_tx),
        };
        let engine = ConnectionEngine::new(ctx, config, state_tx, event_tx.clone(), pending.clone());
        let task = tokio::spawn(engine.run(command_rx));

        (
            Self {
                identity,
                commands: command_tx,
                state: state_rx,
                settings: settings_rx,
                events: event_tx,
                pending,
            },
            task,
        )
    }

    pub fn identity(&self) -> &BeaconIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn settings(&self) -> BeaconSettings {
        self.settings.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Transactions queued or in flight
    pub fn pending_transactions(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Connect, or join a connection attempt already in progress
    pub async fn connect(&self) -> BeaconResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Connect { reply })?;
        Pending::new(rx).await
    }

    /// Disconnect, failing every pending transaction with `ConnectionLost`
    pub async fn disconnect(&self) -> BeaconResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Disconnect { reply })?;
        Pending::new(rx).await
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Queue a read; the result resolves once the transaction completes
    pub fn read(&self, attribute: Attribute) -> Pending<AttributeValue> {
        let (reply, rx) = oneshot::channel();
        match self.send(EngineCommand::Submit(Request::Read { attribute, reply })) {
            Ok(()) => Pending::new(rx),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Queue a write under the configured policy for its attribute
    pub fn write(&self, value: AttributeValue) -> Pending<WriteAck> {
        let attribute = value.attribute();
        if !attribute.is_writable() {
            return Pending::ready(Err(BeaconError::unsupported(attribute.name(), value)));
        }
        let (reply, rx) = oneshot::channel();
        match self.send(EngineCommand::Submit(Request::Write { value, reply })) {
            Ok(()) => Pending::new(rx),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    pub async fn read_major(&self) -> BeaconResult<u16> {
        match self.read(Attribute::Major).await? {
            AttributeValue::Major(v) => Ok(v),
            other => Err(unexpected(Attribute::Major, other)),
        }
    }

    pub async fn read_minor(&self) -> BeaconResult<u16> {
        match self.read(Attribute::Minor).await? {
            AttributeValue::Minor(v) => Ok(v),
            other => Err(unexpected(Attribute::Minor, other)),
        }
    }

    pub async fn read_power(&self) -> BeaconResult<TxPower> {
        match self.read(Attribute::Power).await? {
            AttributeValue::Power(p) => Ok(p),
            other => Err(unexpected(Attribute::Power, other)),
        }
    }

    pub async fn read_frequency(&self) -> BeaconResult<AdvertisingInterval> {
        match self.read(Attribute::Frequency).await? {
            AttributeValue::Frequency(i) => Ok(i),
            other => Err(unexpected(Attribute::Frequency, other)),
        }
    }

    pub async fn read_battery(&self) -> BeaconResult<BatteryLevel> {
        match self.read(Attribute::Battery).await? {
            AttributeValue::Battery(b) => Ok(b),
            other => Err(unexpected(Attribute::Battery, other)),
        }
    }

    pub async fn read_hardware_version(&self) -> BeaconResult<String> {
        match self.read(Attribute::HardwareVersion).await? {
            AttributeValue::HardwareVersion(s) => Ok(s),
            other => Err(unexpected(Attribute::HardwareVersion, other)),
        }
    }

    pub async fn read_firmware_version(&self) -> BeaconResult<String> {
        match self.read(Attribute::FirmwareVersion).await? {
            AttributeValue::FirmwareVersion(s) => Ok(s),
            other => Err(unexpected(Attribute::FirmwareVersion, other)),
        }
    }

    pub async fn write_major(&self, major: u16) -> BeaconResult<WriteAck> {
        self.write(AttributeValue::Major(major)).await
    }

    pub async fn write_minor(&self, minor: u16) -> BeaconResult<WriteAck> {
        self.write(AttributeValue::Minor(minor)).await
    }

    pub async fn write_power(&self, power: TxPower) -> BeaconResult<WriteAck> {
        self.write(AttributeValue::Power(power)).await
    }

    pub async fn write_frequency(&self, interval: AdvertisingInterval) -> BeaconResult<WriteAck> {
        self.write(AttributeValue::Frequency(interval)).await
    }

    /// Read every attribute in order and return the refreshed snapshot
    pub async fn read_all_settings(&self) -> BeaconResult<BeaconSettings> {
        // queue everything up front so the reads run back to back
        let reads: Vec<Pending<AttributeValue>> =
            Attribute::ALL.iter().map(|attribute| self.read(*attribute)).collect();
        for read in reads {
            read.await?;
        }
        Ok(self.settings())
    }

    /// Queue a firmware update as an exclusive transaction
    pub fn update_firmware(&self, source: Arc<dyn FirmwareSource>) -> FirmwareUpdate {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        let completion = match self.send(EngineCommand::Submit(Request::FirmwareUpdate {
            source,
            progress: progress_tx,
            reply,
        })) {
            Ok(()) => Pending::new(rx),
            Err(e) => Pending::ready(Err(e)),
        };
        FirmwareUpdate {
            progress: progress_rx,
            completion,
        }
    }

    /// Reference that does not keep the engine alive
    pub(crate) fn downgrade(&self) -> WeakBeaconHandle {
        WeakBeaconHandle {
            identity: self.identity,
            commands: self.commands.downgrade(),
            state: self.state.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
            pending: self.pending.clone(),
        }
    }

    fn send(&self, command: EngineCommand) -> BeaconResult<()> {
        self.commands.send(command).map_err(|_| BeaconError::Shutdown {
            reason: format!("connection engine for {} stopped", self.identity.address),
        })
    }
}

impl fmt::Debug for BeaconHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeaconHandle")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

/// A [`BeaconHandle`] that lets the engine stop once every strong handle is gone
#[derive(Clone)]
pub(crate) struct WeakBeaconHandle {
    identity: BeaconIdentity,
    commands: mpsc::WeakUnboundedSender<EngineCommand>,
    state: watch::Receiver<ConnectionState>,
    settings: watch::Receiver<BeaconSettings>,
    events: broadcast::Sender<ConnectionEvent>,
    pending: Arc<AtomicUsize>,
}

impl WeakBeaconHandle {
    /// The live handle, or `None` if its engine has stopped
    pub(crate) fn upgrade(&self) -> Option<BeaconHandle> {
        let commands = self.commands.upgrade()?;
        Some(BeaconHandle {
            identity: self.identity,
            commands,
            state: self.state.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
            pending: self.pending.clone(),
        })
    }
}

fn unexpected(attribute: Attribute, value: AttributeValue) -> BeaconError {
    BeaconError::anomaly(format!("{} read returned {:?}", attribute, value))
}
