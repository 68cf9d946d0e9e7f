//! Discovery manager
//!
//! A single actor task owns the [`RegionRouter`] and every platform registration.
//! Caller requests and platform callbacks are processed one at a time on that task,
//! so registrations against the shared platform primitives never overlap and each
//! region's state is only ever touched from one place.
//!
//! [`DiscoveryManager`] is the cloneable handle to the actor. Dropping every handle
//! (or calling [`DiscoveryManager::shutdown`]) stops all platform activity.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use beacon_core::{BeaconError, BeaconResult, Region, TxPower, VirtualBeacon};

use crate::config::DiscoveryConfig;
use crate::error::{advertising_error, PlatformError};
use crate::events::BeaconEvent;
use crate::platform::{
    PlatformAdvertiser, PlatformDiscovery, PlatformEvent, PlatformRegionMonitor, PlatformResult,
    ScanFilter,
};
use crate::router::RegionRouter;

// ----------------------------------------------------------------------------
// Platform Services
// ----------------------------------------------------------------------------

/// Platform collaborators driven by the discovery manager
pub struct PlatformServices {
    pub discovery: Arc<dyn PlatformDiscovery>,
    pub monitor: Arc<dyn PlatformRegionMonitor>,
    pub advertiser: Box<dyn PlatformAdvertiser>,
}

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<T>;

enum DiscoveryCommand {
    StartMonitoring {
        region: Region,
        reply: Reply<BeaconResult<()>>,
    },
    StopMonitoring {
        identifier: String,
        reply: Reply<BeaconResult<()>>,
    },
    StartRanging {
        region: Region,
        reply: Reply<BeaconResult<()>>,
    },
    StopRanging {
        identifier: String,
        reply: Reply<BeaconResult<()>>,
    },
    RequestState {
        identifier: String,
        reply: Reply<BeaconResult<()>>,
    },
    StartDiscovery {
        region: Region,
        reply: Reply<BeaconResult<()>>,
    },
    StopDiscovery {
        reply: Reply<BeaconResult<()>>,
    },
    StartAdvertising {
        beacon: VirtualBeacon,
        tx_power: TxPower,
        reply: Reply<BeaconResult<()>>,
    },
    StopAdvertising {
        reply: Reply<BeaconResult<()>>,
    },
    MonitoredRegions {
        reply: Reply<Vec<Region>>,
    },
    RangedRegions {
        reply: Reply<Vec<Region>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct DiscoveryManager {
    commands: mpsc::UnboundedSender<DiscoveryCommand>,
    events: broadcast::Sender<BeaconEvent>,
}

impl DiscoveryManager {
    /// Spawn the discovery actor on the current runtime
    ///
    /// `platform_events` carries the unsolicited callbacks of every collaborator in
    /// `services`.
    pub fn spawn(
        services: PlatformServices,
        platform_events: mpsc::UnboundedReceiver<PlatformEvent>,
        config: DiscoveryConfig,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_buffer_size.max(1));

        let actor = DiscoveryActor {
            router: RegionRouter::new(config.monitoring.clone()),
            services,
            platform_timeout: config.platform_timeout,
            events: event_tx.clone(),
        };
        let task = tokio::spawn(actor.run(command_rx, platform_events, config));

        (
            Self {
                commands: command_tx,
                events: event_tx,
            },
            task,
        )
    }

    /// Register a new subscriber; events published before this call are not replayed
    pub fn subscribe(&self) -> broadcast::Receiver<BeaconEvent> {
        self.events.subscribe()
    }

    pub async fn start_monitoring(&self, region: Region) -> BeaconResult<()> {
        self.request(|reply| DiscoveryCommand::StartMonitoring { region, reply })
            .await?
    }

    /// Stop monitoring; unknown regions are ignored
    pub async fn stop_monitoring(&self, identifier: impl Into<String>) -> BeaconResult<()> {
        let identifier = identifier.into();
        self.request(|reply| DiscoveryCommand::StopMonitoring { identifier, reply })
            .await?
    }

    pub async fn start_ranging(&self, region: Region) -> BeaconResult<()> {
        self.request(|reply| DiscoveryCommand::StartRanging { region, reply })
            .await?
    }

    /// Stop ranging; unknown regions are ignored
    pub async fn stop_ranging(&self, identifier: impl Into<String>) -> BeaconResult<()> {
        let identifier = identifier.into();
        self.request(|reply| DiscoveryCommand::StopRanging { identifier, reply })
            .await?
    }

    /// Ask the platform for the current state of a monitored region
    ///
    /// The answer arrives as [`BeaconEvent::RegionStateDetermined`].
    pub async fn request_state(&self, identifier: impl Into<String>) -> BeaconResult<()> {
        let identifier = identifier.into();
        self.request(|reply| DiscoveryCommand::RequestState { identifier, reply })
            .await?
    }

    /// Scan for beacons matching `region`, replacing any discovery in progress
    pub async fn start_discovery(&self, region: Region) -> BeaconResult<()> {
        self.request(|reply| DiscoveryCommand::StartDiscovery { region, reply })
            .await?
    }

    pub async fn stop_discovery(&self) -> BeaconResult<()> {
        self.request(|reply| DiscoveryCommand::StopDiscovery { reply })
            .await?
    }

    pub async fn start_advertising(
        &self,
        beacon: VirtualBeacon,
        tx_power: TxPower,
    ) -> BeaconResult<()> {
        self.request(|reply| DiscoveryCommand::StartAdvertising {
            beacon,
            tx_power,
            reply,
        })
        .await?
    }

    pub async fn stop_advertising(&self) -> BeaconResult<()> {
        self.request(|reply| DiscoveryCommand::StopAdvertising { reply })
            .await?
    }

    pub async fn monitored_regions(&self) -> BeaconResult<Vec<Region>> {
        self.request(|reply| DiscoveryCommand::MonitoredRegions { reply })
            .await
    }

    pub async fn ranged_regions(&self) -> BeaconResult<Vec<Region>> {
        self.request(|reply| DiscoveryCommand::RangedRegions { reply })
            .await
    }

    /// Stop every platform registration and end the actor
    pub async fn shutdown(&self) -> BeaconResult<()> {
        self.request(|reply| DiscoveryCommand::Shutdown { reply })
            .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> DiscoveryCommand,
    ) -> BeaconResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())
    }
}

fn stopped() -> BeaconError {
    BeaconError::Shutdown {
        reason: "discovery manager stopped".to_string(),
    }
}

// ----------------------------------------------------------------------------
// Actor
// ----------------------------------------------------------------------------

struct DiscoveryActor {
    router: RegionRouter,
    services: PlatformServices,
    /// Every platform request is bounded by this so the loop keeps turning
    platform_timeout: Duration,
    events: broadcast::Sender<BeaconEvent>,
}

impl DiscoveryActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DiscoveryCommand>,
        mut platform_events: mpsc::UnboundedReceiver<PlatformEvent>,
        config: DiscoveryConfig,
    ) {
        info!("Discovery manager starting");

        let mut tick = tokio::time::interval(config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut platform_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(DiscoveryCommand::Shutdown { reply }) => {
                            self.teardown().await;
                            let _ = reply.send(());
                            info!("Discovery manager stopped");
                            return;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            info!("All discovery handles dropped, shutting down");
                            break;
                        }
                    }
                }

                event = platform_events.recv(), if platform_open => {
                    match event {
                        Some(event) => self.handle_platform_event(event),
                        None => {
                            warn!("Platform event channel closed");
                            platform_open = false;
                        }
                    }
                }

                _ = tick.tick() => {
                    let events = self.router.tick(now());
                    self.publish(events);
                }
            }
        }

        self.teardown().await;
        info!("Discovery manager stopped");
    }

    async fn handle_command(&mut self, command: DiscoveryCommand) {
        match command {
            DiscoveryCommand::StartMonitoring { region, reply } => {
                let _ = reply.send(self.start_monitoring(region).await);
            }
            DiscoveryCommand::StopMonitoring { identifier, reply } => {
                let _ = reply.send(self.stop_monitoring(&identifier).await);
            }
            DiscoveryCommand::StartRanging { region, reply } => {
                let _ = reply.send(self.start_ranging(region).await);
            }
            DiscoveryCommand::StopRanging { identifier, reply } => {
                let _ = reply.send(self.stop_ranging(&identifier).await);
            }
            DiscoveryCommand::RequestState { identifier, reply } => {
                let _ = reply.send(self.request_state(&identifier).await);
            }
            DiscoveryCommand::StartDiscovery { region, reply } => {
                let _ = reply.send(self.start_discovery(region).await);
            }
            DiscoveryCommand::StopDiscovery { reply } => {
                let _ = reply.send(self.stop_discovery().await);
            }
            DiscoveryCommand::StartAdvertising {
                beacon,
                tx_power,
                reply,
            } => {
                let _ = reply.send(self.start_advertising(beacon, tx_power).await);
            }
            DiscoveryCommand::StopAdvertising { reply } => {
                let _ = reply.send(self.stop_advertising().await);
            }
            DiscoveryCommand::MonitoredRegions { reply } => {
                let _ = reply.send(self.router.monitored_regions());
            }
            DiscoveryCommand::RangedRegions { reply } => {
                let _ = reply.send(self.router.ranged_regions());
            }
            DiscoveryCommand::Shutdown { reply } => {
                // handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    fn handle_platform_event(&mut self, event: PlatformEvent) {
        match self.router.handle(event, now()) {
            Ok(events) => self.publish(events),
            Err(e) => debug!("Platform event dropped: {}", e),
        }
    }

    fn publish(&self, events: Vec<BeaconEvent>) {
        for event in events {
            // no subscribers is not an error
            let _ = self.events.send(event);
        }
    }

    // ------------------------------------------------------------------------
    // Monitoring and Ranging
    // ------------------------------------------------------------------------

    async fn start_monitoring(&mut self, region: Region) -> BeaconResult<()> {
        let criteria = region.criteria();
        let identifier = region.identifier().to_string();
        self.router.add_monitored(region, now())?;

        let request = self.services.monitor.start_monitoring(&identifier, &criteria);
        if let Err(e) = bounded(self.platform_timeout, request, BeaconError::from).await {
            error!("Platform refused monitoring for {}: {}", identifier, e);
            self.router.remove_monitored(&identifier);
            return Err(e);
        }
        Ok(())
    }

    async fn stop_monitoring(&mut self, identifier: &str) -> BeaconResult<()> {
        if self.router.remove_monitored(identifier).is_none() {
            debug!("Region {} is not monitored", identifier);
            return Ok(());
        }
        let request = self.services.monitor.stop_monitoring(identifier);
        bounded(self.platform_timeout, request, BeaconError::from).await
    }

    async fn start_ranging(&mut self, region: Region) -> BeaconResult<()> {
        let criteria = region.criteria();
        let identifier = region.identifier().to_string();
        self.router.add_ranged(region)?;

        let request = self.services.monitor.start_ranging(&identifier, &criteria);
        if let Err(e) = bounded(self.platform_timeout, request, BeaconError::from).await {
            error!("Platform refused ranging for {}: {}", identifier, e);
            self.router.remove_ranged(&identifier);
            return Err(e);
        }
        Ok(())
    }

    async fn stop_ranging(&mut self, identifier: &str) -> BeaconResult<()> {
        if self.router.remove_ranged(identifier).is_none() {
            debug!("Region {} is not ranged", identifier);
            return Ok(());
        }
        let request = self.services.monitor.stop_ranging(identifier);
        bounded(self.platform_timeout, request, BeaconError::from).await
    }

    async fn request_state(&mut self, identifier: &str) -> BeaconResult<()> {
        if self.router.monitored_region(identifier).is_none() {
            return Err(BeaconError::InvalidRegion {
                identifier: identifier.to_string(),
                reason: "region is not monitored".to_string(),
            });
        }
        let request = self.services.monitor.request_state(identifier);
        bounded(self.platform_timeout, request, BeaconError::from).await
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    async fn start_discovery(&mut self, region: Region) -> BeaconResult<()> {
        let filter = ScanFilter {
            proximity_uuids: vec![region.proximity_uuid()],
        };
        if let Some(previous) = self.router.set_discovery(region.clone())? {
            info!("Discovery for {} replaced by {}", previous, region);
            let request = self.services.discovery.stop_scan();
            if let Err(e) = bounded(self.platform_timeout, request, BeaconError::from).await {
                warn!("Failed to stop previous scan: {}", e);
            }
        }

        let request = self.services.discovery.start_scan(filter);
        if let Err(error) = bounded(self.platform_timeout, request, BeaconError::from).await {
            error!("Failed to start scan for {}: {}", region, error);
            self.router.clear_discovery();
            self.publish(vec![BeaconEvent::DiscoveryFailed {
                region,
                error: error.clone(),
            }]);
            return Err(error);
        }
        Ok(())
    }

    async fn stop_discovery(&mut self) -> BeaconResult<()> {
        match self.router.clear_discovery() {
            Some(region) => {
                info!("Stopped discovery for {}", region);
                let request = self.services.discovery.stop_scan();
                bounded(self.platform_timeout, request, BeaconError::from).await
            }
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    async fn start_advertising(
        &mut self,
        beacon: VirtualBeacon,
        tx_power: TxPower,
    ) -> BeaconResult<()> {
        let request = self.services.advertiser.start_advertising(&beacon, tx_power);
        let result = bounded(self.platform_timeout, request, advertising_error).await;

        match &result {
            Ok(()) => info!("Advertising virtual beacon {}", beacon.identifier),
            Err(e) => error!("Advertising {} failed: {}", beacon.identifier, e),
        }
        self.publish(vec![BeaconEvent::AdvertisingStarted(result.clone())]);
        result
    }

    async fn stop_advertising(&mut self) -> BeaconResult<()> {
        if !self.services.advertiser.is_advertising() {
            return Ok(());
        }
        let request = self.services.advertiser.stop_advertising();
        bounded(self.platform_timeout, request, advertising_error).await?;
        self.publish(vec![BeaconEvent::AdvertisingStopped(None)]);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    async fn teardown(&mut self) {
        for region in self.router.monitored_regions() {
            if let Err(e) = self.stop_monitoring(region.identifier()).await {
                warn!("Failed to stop monitoring {}: {}", region, e);
            }
        }
        for region in self.router.ranged_regions() {
            if let Err(e) = self.stop_ranging(region.identifier()).await {
                warn!("Failed to stop ranging {}: {}", region, e);
            }
        }
        if let Err(e) = self.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
        }
        if let Err(e) = self.stop_advertising().await {
            warn!("Failed to stop advertising: {}", e);
        }
    }
}

/// Run one platform request, failing with `Timeout` once `limit` passes
async fn bounded<T>(
    limit: Duration,
    request: impl Future<Output = PlatformResult<T>>,
    on_error: fn(PlatformError) -> BeaconError,
) -> BeaconResult<T> {
    match tokio::time::timeout(limit, request).await {
        Ok(result) => result.map_err(on_error),
        Err(_) => {
            warn!("Platform request timed out after {:?}", limit);
            Err(BeaconError::Timeout {
                duration_ms: limit.as_millis() as u64,
            })
        }
    }
}

/// Current time on the runtime clock, so paused test time applies
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
