//! Region routing
//!
//! Owns the active monitoring, ranging and discovery registrations and routes each
//! platform event to the state machine or session it belongs to. The router is
//! synchronous; the discovery actor feeds it events and timestamps and publishes
//! whatever it returns.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use beacon_core::{
    decode_advertisement, BeaconError, BeaconIdentity, BeaconResult, MonitoringConfig,
    RangingSession, Region, RegionStateMachine, RegionTransition, Sighting,
};

use crate::error::advertising_error;
use crate::events::BeaconEvent;
use crate::platform::PlatformEvent;

// ----------------------------------------------------------------------------
// Discovery Session
// ----------------------------------------------------------------------------

/// Beacons seen by an active scan-based discovery
#[derive(Debug, Clone)]
struct DiscoverySession {
    region: Region,
    seen: HashMap<BeaconIdentity, Sighting>,
}

impl DiscoverySession {
    fn new(region: Region) -> Self {
        Self {
            region,
            seen: HashMap::new(),
        }
    }

    /// Record a sighting; returns whether it belongs to the region
    fn record(&mut self, sighting: &Sighting) -> bool {
        if !self.region.matches(&sighting.identity) {
            return false;
        }
        self.seen.insert(sighting.identity, sighting.clone());
        true
    }

    fn beacons(&self) -> Vec<Sighting> {
        let mut beacons: Vec<Sighting> = self.seen.values().cloned().collect();
        beacons.sort_by(|a, b| {
            b.rssi
                .cmp(&a.rssi)
                .then(a.identity.major.cmp(&b.identity.major))
                .then(a.identity.minor.cmp(&b.identity.minor))
                .then(a.identity.address.cmp(&b.identity.address))
        });
        beacons
    }
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct RegionRouter {
    config: MonitoringConfig,
    monitored: HashMap<String, RegionStateMachine>,
    ranged: HashMap<String, RangingSession>,
    discovery: Option<DiscoverySession>,
}

impl RegionRouter {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            monitored: HashMap::new(),
            ranged: HashMap::new(),
            discovery: None,
        }
    }

    // ------------------------------------------------------------------------
    // Registrations
    // ------------------------------------------------------------------------

    pub fn add_monitored(&mut self, region: Region, now: Instant) -> BeaconResult<()> {
        region.validate()?;
        if self.monitored.contains_key(region.identifier()) {
            return Err(BeaconError::DuplicateRegion {
                identifier: region.identifier().to_string(),
            });
        }
        info!("Monitoring region {}", region);
        let machine = RegionStateMachine::new(region.clone(), &self.config, now);
        self.monitored.insert(region.identifier().to_string(), machine);
        Ok(())
    }

    pub fn remove_monitored(&mut self, identifier: &str) -> Option<Region> {
        let machine = self.monitored.remove(identifier)?;
        info!("Stopped monitoring region {}", identifier);
        Some(machine.region().clone())
    }

    pub fn add_ranged(&mut self, region: Region) -> BeaconResult<()> {
        region.validate()?;
        if self.ranged.contains_key(region.identifier()) {
            return Err(BeaconError::DuplicateRegion {
                identifier: region.identifier().to_string(),
            });
        }
        info!("Ranging region {}", region);
        let session = RangingSession::new(region.clone(), &self.config);
        self.ranged.insert(region.identifier().to_string(), session);
        Ok(())
    }

    pub fn remove_ranged(&mut self, identifier: &str) -> Option<Region> {
        let session = self.ranged.remove(identifier)?;
        info!("Stopped ranging region {}", identifier);
        Some(session.region().clone())
    }

    /// Start discovery for `region`, returning the region it replaced
    pub fn set_discovery(&mut self, region: Region) -> BeaconResult<Option<Region>> {
        region.validate()?;
        info!("Discovering beacons in region {}", region);
        let previous = self.discovery.replace(DiscoverySession::new(region));
        Ok(previous.map(|session| session.region))
    }

    pub fn clear_discovery(&mut self) -> Option<Region> {
        self.discovery.take().map(|session| session.region)
    }

    pub fn monitored_region(&self, identifier: &str) -> Option<&Region> {
        self.monitored.get(identifier).map(|machine| machine.region())
    }

    pub fn monitored_regions(&self) -> Vec<Region> {
        let mut regions: Vec<Region> = self
            .monitored
            .values()
            .map(|machine| machine.region().clone())
            .collect();
        regions.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        regions
    }

    pub fn ranged_regions(&self) -> Vec<Region> {
        let mut regions: Vec<Region> = self
            .ranged
            .values()
            .map(|session| session.region().clone())
            .collect();
        regions.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        regions
    }

    pub fn discovery_region(&self) -> Option<&Region> {
        self.discovery.as_ref().map(|session| &session.region)
    }

    // ------------------------------------------------------------------------
    // Event Routing
    // ------------------------------------------------------------------------

    /// Route one platform event
    ///
    /// Events naming a region that is not registered are reported as
    /// [`BeaconError::ProtocolAnomaly`] and change nothing.
    pub fn handle(&mut self, event: PlatformEvent, now: Instant) -> BeaconResult<Vec<BeaconEvent>> {
        match event {
            PlatformEvent::Advertisement(raw) => {
                let sighting = match decode_advertisement(&raw, now) {
                    Ok(sighting) => sighting,
                    Err(e) => {
                        trace!("Dropping advertisement from {}: {}", raw.address, e);
                        return Ok(Vec::new());
                    }
                };
                Ok(self.on_sighting(&sighting))
            }

            PlatformEvent::ScanFailed { error } => match self.discovery.take() {
                Some(session) => Ok(vec![BeaconEvent::DiscoveryFailed {
                    region: session.region,
                    error: error.into(),
                }]),
                None => Err(anomaly(format!("scan failure with no active discovery: {}", error))),
            },

            PlatformEvent::RegionEntered { region_id } => {
                let machine = self.machine(&region_id)?;
                let transition = machine.on_platform_enter(now);
                Ok(transition_event(machine.region(), transition).into_iter().collect())
            }

            PlatformEvent::RegionExited { region_id } => {
                let machine = self.machine(&region_id)?;
                let transition = machine.on_platform_exit(now);
                Ok(transition_event(machine.region(), transition).into_iter().collect())
            }

            PlatformEvent::RegionStateDetermined { region_id, status } => {
                let machine = self.machine(&region_id)?;
                let transition = machine.on_state_determined(status, now);
                let mut events = vec![BeaconEvent::RegionStateDetermined {
                    region: machine.region().clone(),
                    status,
                }];
                events.extend(transition_event(machine.region(), transition));
                Ok(events)
            }

            PlatformEvent::RangingUpdate {
                region_id,
                sightings,
            } => {
                let session = self.ranged.get_mut(&region_id).ok_or_else(|| {
                    anomaly(format!("ranging update for unknown region {}", region_id))
                })?;
                let snapshot = session.update(sightings, now);
                debug!(
                    "Ranging snapshot for {}: {} beacon(s)",
                    region_id,
                    snapshot.len()
                );
                Ok(vec![BeaconEvent::RangingSnapshot {
                    region: session.region().clone(),
                    sightings: snapshot,
                }])
            }

            PlatformEvent::MonitoringFailed { region_id, error } => {
                let machine = self.monitored.remove(&region_id).ok_or_else(|| {
                    anomaly(format!("monitoring failure for unknown region {}", region_id))
                })?;
                warn!("Monitoring failed for region {}: {}", region_id, error);
                Ok(vec![BeaconEvent::MonitoringFailed {
                    region: machine.region().clone(),
                    error: error.into(),
                }])
            }

            PlatformEvent::RangingFailed { region_id, error } => {
                let session = self.ranged.remove(&region_id).ok_or_else(|| {
                    anomaly(format!("ranging failure for unknown region {}", region_id))
                })?;
                warn!("Ranging failed for region {}: {}", region_id, error);
                Ok(vec![BeaconEvent::RangingFailed {
                    region: session.region().clone(),
                    error: error.into(),
                }])
            }

            PlatformEvent::AdvertisingStopped { error } => {
                Ok(vec![BeaconEvent::AdvertisingStopped(error.map(advertising_error))])
            }
        }
    }

    /// Apply silence timers to every monitored region
    pub fn tick(&mut self, now: Instant) -> Vec<BeaconEvent> {
        let mut events = Vec::new();
        for machine in self.monitored.values_mut() {
            let transition = machine.tick(now);
            events.extend(transition_event(machine.region(), transition));
        }
        events
    }

    fn on_sighting(&mut self, sighting: &Sighting) -> Vec<BeaconEvent> {
        let mut events = Vec::new();
        for machine in self.monitored.values_mut() {
            let transition = machine.on_sighting(sighting);
            events.extend(transition_event(machine.region(), transition));
        }
        if let Some(session) = self.discovery.as_mut() {
            if session.record(sighting) {
                events.push(BeaconEvent::BeaconsDiscovered {
                    region: session.region.clone(),
                    beacons: session.beacons(),
                });
            }
        }
        events
    }

    fn machine(&mut self, region_id: &str) -> BeaconResult<&mut RegionStateMachine> {
        self.monitored
            .get_mut(region_id)
            .ok_or_else(|| anomaly(format!("region event for unknown region {}", region_id)))
    }
}

fn transition_event(region: &Region, transition: Option<RegionTransition>) -> Option<BeaconEvent> {
    match transition? {
        RegionTransition::Entered => Some(BeaconEvent::RegionEntered(region.clone())),
        RegionTransition::Exited => Some(BeaconEvent::RegionExited(region.clone())),
    }
}

fn anomaly(reason: String) -> BeaconError {
    warn!("Protocol anomaly: {}", reason);
    BeaconError::anomaly(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use beacon_core::advertisement::encode_advertisement;
    use beacon_core::{HardwareAddress, RawAdvertisement, RegionStatus, VirtualBeacon};

    use crate::error::PlatformError;

    fn advertisement(major: u16, minor: u16, rssi: i16) -> PlatformEvent {
        PlatformEvent::Advertisement(RawAdvertisement {
            address: HardwareAddress::new([0, 0, 0, 0, (major & 0xff) as u8, (minor & 0xff) as u8]),
            payload: encode_advertisement(&VirtualBeacon::new("b", major, minor)),
            rssi,
        })
    }

    fn router() -> RegionRouter {
        RegionRouter::new(MonitoringConfig::default().with_exit_silence(Duration::from_secs(10)))
    }

    #[test]
    fn test_duplicate_monitoring_rejected() {
        let t0 = Instant::now();
        let mut router = router();
        router.add_monitored(Region::new("home"), t0).unwrap();
        let err = router.add_monitored(Region::new("home").major(3), t0).unwrap_err();
        assert_eq!(
            err,
            BeaconError::DuplicateRegion {
                identifier: "home".to_string()
            }
        );
        // ranging keeps its own registrations
        assert!(router.add_ranged(Region::new("home")).is_ok());
    }

    #[test]
    fn test_advertisement_drives_monitored_region() {
        let t0 = Instant::now();
        let mut router = router();
        router.add_monitored(Region::new("home").major(1), t0).unwrap();

        let events = router.handle(advertisement(1, 5, -60), t0).unwrap();
        assert!(matches!(&events[..], [BeaconEvent::RegionEntered(r)] if r.identifier() == "home"));
        assert!(router.handle(advertisement(1, 5, -60), t0).unwrap().is_empty());
        assert!(router.handle(advertisement(2, 5, -60), t0).unwrap().is_empty());

        let events = router.tick(t0 + Duration::from_secs(11));
        assert!(matches!(&events[..], [BeaconEvent::RegionExited(r)] if r.identifier() == "home"));
    }

    #[test]
    fn test_malformed_advertisement_dropped() {
        let mut router = router();
        let event = PlatformEvent::Advertisement(RawAdvertisement {
            address: HardwareAddress::default(),
            payload: vec![0x02, 0x01, 0x06],
            rssi: -40,
        });
        assert!(router.handle(event, Instant::now()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_region_is_anomaly() {
        let mut router = router();
        let result = router.handle(
            PlatformEvent::RegionEntered {
                region_id: "ghost".to_string(),
            },
            Instant::now(),
        );
        assert!(matches!(result, Err(BeaconError::ProtocolAnomaly { .. })));
        assert!(router.monitored_regions().is_empty());
    }

    #[test]
    fn test_state_determined_reports_then_transitions() {
        let t0 = Instant::now();
        let mut router = router();
        router.add_monitored(Region::new("home"), t0).unwrap();
        let events = router
            .handle(
                PlatformEvent::RegionStateDetermined {
                    region_id: "home".to_string(),
                    status: RegionStatus::Inside,
                },
                t0,
            )
            .unwrap();
        assert!(matches!(
            &events[..],
            [
                BeaconEvent::RegionStateDetermined {
                    status: RegionStatus::Inside,
                    ..
                },
                BeaconEvent::RegionEntered(_)
            ]
        ));
    }

    #[test]
    fn test_monitoring_failure_removes_region() {
        let t0 = Instant::now();
        let mut router = router();
        router.add_monitored(Region::new("home"), t0).unwrap();
        let events = router
            .handle(
                PlatformEvent::MonitoringFailed {
                    region_id: "home".to_string(),
                    error: PlatformError::PoweredOff,
                },
                t0,
            )
            .unwrap();
        assert!(matches!(&events[..], [BeaconEvent::MonitoringFailed { .. }]));
        assert!(router.monitored_region("home").is_none());
        assert!(router.add_monitored(Region::new("home"), t0).is_ok());
    }

    #[test]
    fn test_discovery_dedupes_and_orders() {
        let t0 = Instant::now();
        let mut router = router();
        router.set_discovery(Region::new("all")).unwrap();

        router.handle(advertisement(1, 1, -80), t0).unwrap();
        router.handle(advertisement(1, 2, -50), t0).unwrap();
        let events = router.handle(advertisement(1, 1, -70), t0).unwrap();

        match &events[..] {
            [BeaconEvent::BeaconsDiscovered { beacons, .. }] => {
                let seen: Vec<(u16, i16)> =
                    beacons.iter().map(|s| (s.identity.minor, s.rssi)).collect();
                assert_eq!(seen, vec![(2, -50), (1, -70)]);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_scan_failure_ends_discovery() {
        let mut router = router();
        router.set_discovery(Region::new("all")).unwrap();
        let events = router
            .handle(
                PlatformEvent::ScanFailed {
                    error: PlatformError::PoweredOff,
                },
                Instant::now(),
            )
            .unwrap();
        assert!(matches!(&events[..], [BeaconEvent::DiscoveryFailed { .. }]));
        assert!(router.discovery_region().is_none());
    }
}
