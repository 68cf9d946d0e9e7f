//! Ranging sessions
//!
//! A session keeps the most recent sighting of every beacon in one region and turns
//! each platform ranging batch into an ordered snapshot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::MonitoringConfig;
use crate::proximity::Proximity;
use crate::types::{BeaconIdentity, Region, Sighting};

#[derive(Debug, Clone)]
pub struct RangingSession {
    region: Region,
    latest: HashMap<BeaconIdentity, Sighting>,
    staleness: Duration,
    avoid_unknown: bool,
}

impl RangingSession {
    pub fn new(region: Region, config: &MonitoringConfig) -> Self {
        Self {
            region,
            latest: HashMap::new(),
            staleness: config.ranging_staleness,
            avoid_unknown: config.avoid_unknown_proximity,
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Number of beacons currently tracked, including ones a snapshot would filter
    pub fn tracked(&self) -> usize {
        self.latest.len()
    }

    /// Merge a ranging batch and return the resulting snapshot
    ///
    /// An empty batch still ages out stale entries and yields a (possibly empty)
    /// snapshot.
    pub fn update<I>(&mut self, batch: I, now: Instant) -> Vec<Sighting>
    where
        I: IntoIterator<Item = Sighting>,
    {
        for sighting in batch {
            if !self.region.matches(&sighting.identity) {
                trace!(
                    "Ignoring {} outside ranged region {}",
                    sighting.identity,
                    self.region
                );
                continue;
            }
            match self.latest.get(&sighting.identity) {
                Some(existing) if existing.timestamp > sighting.timestamp => {}
                _ => {
                    self.latest.insert(sighting.identity, sighting);
                }
            }
        }

        let staleness = self.staleness;
        self.latest
            .retain(|_, s| now.saturating_duration_since(s.timestamp) < staleness);

        self.snapshot()
    }

    /// Current sightings, strongest signal first
    pub fn snapshot(&self) -> Vec<Sighting> {
        let mut sightings: Vec<Sighting> = self
            .latest
            .values()
            .filter(|s| !self.avoid_unknown || s.proximity().proximity != Proximity::Unknown)
            .cloned()
            .collect();

        sightings.sort_by(|a, b| {
            b.rssi
                .cmp(&a.rssi)
                .then(a.identity.major.cmp(&b.identity.major))
                .then(a.identity.minor.cmp(&b.identity.minor))
                .then(a.identity.address.cmp(&b.identity.address))
        });
        sightings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HardwareAddress, DEFAULT_PROXIMITY_UUID};

    fn sighting(minor: u16, rssi: i16, at: Instant) -> Sighting {
        Sighting {
            identity: BeaconIdentity::new(
                DEFAULT_PROXIMITY_UUID,
                1,
                minor,
                HardwareAddress::new([0, 0, 0, 0, 0, minor as u8]),
            ),
            measured_power: -59,
            rssi,
            timestamp: at,
        }
    }

    fn session() -> RangingSession {
        let config = MonitoringConfig::default().with_ranging_staleness(Duration::from_secs(5));
        RangingSession::new(Region::new("lobby").major(1), &config)
    }

    #[test]
    fn test_snapshot_ordered_by_signal_strength() {
        let t0 = Instant::now();
        let mut session = session();
        let snapshot = session.update(
            vec![sighting(1, -80, t0), sighting(2, -55, t0), sighting(3, -70, t0)],
            t0,
        );
        let minors: Vec<u16> = snapshot.iter().map(|s| s.identity.minor).collect();
        assert_eq!(minors, vec![2, 3, 1]);
    }

    #[test]
    fn test_newer_sighting_replaces_entry() {
        let t0 = Instant::now();
        let mut session = session();
        session.update(vec![sighting(1, -80, t0)], t0);
        let t1 = t0 + Duration::from_secs(1);
        let snapshot = session.update(vec![sighting(1, -60, t1)], t1);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].rssi, -60);
    }

    #[test]
    fn test_stale_entries_dropped_on_empty_batch() {
        let t0 = Instant::now();
        let mut session = session();
        session.update(vec![sighting(1, -80, t0)], t0);

        let snapshot = session.update(Vec::new(), t0 + Duration::from_secs(2));
        assert_eq!(snapshot.len(), 1);

        let snapshot = session.update(Vec::new(), t0 + Duration::from_secs(6));
        assert!(snapshot.is_empty());
        assert_eq!(session.tracked(), 0);
    }

    #[test]
    fn test_out_of_region_sightings_ignored() {
        let t0 = Instant::now();
        let mut session = session();
        let mut foreign = sighting(1, -50, t0);
        foreign.identity.major = 2;
        assert!(session.update(vec![foreign], t0).is_empty());
    }

    #[test]
    fn test_avoid_unknown_proximity() {
        let t0 = Instant::now();
        let config = MonitoringConfig::default().with_avoid_unknown_proximity(true);
        let mut session = RangingSession::new(Region::new("lobby"), &config);
        let snapshot = session.update(vec![sighting(1, 0, t0), sighting(2, -60, t0)], t0);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].identity.minor, 2);
        assert_eq!(session.tracked(), 2);
    }
}
