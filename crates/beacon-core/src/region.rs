//! Region state machine
//!
//! Tracks whether a single monitored region is currently occupied. Two signals feed
//! the machine:
//!
//! - sightings of matching beacons, with an enter threshold over a sliding window and
//!   an exit after a period of silence
//! - platform region callbacks, which take effect immediately
//!
//! A region entered through a platform callback is not subject to the silence timer;
//! the platform is expected to report the exit itself. The next matching sighting
//! hands control back to the timer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::MonitoringConfig;
use crate::types::{Region, RegionStatus, Sighting};

// ----------------------------------------------------------------------------
// Transitions
// ----------------------------------------------------------------------------

/// Event produced by a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionTransition {
    Entered,
    Exited,
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegionStateMachine {
    region: Region,
    status: RegionStatus,
    enter_window: Duration,
    enter_threshold: usize,
    exit_silence: Duration,
    /// Timestamps of matching sightings within the enter window
    recent: VecDeque<Instant>,
    /// Start of the current silence period
    last_signal: Instant,
    platform_driven: bool,
}

impl RegionStateMachine {
    pub fn new(region: Region, config: &MonitoringConfig, now: Instant) -> Self {
        Self {
            region,
            status: RegionStatus::Unknown,
            enter_window: config.enter_window,
            enter_threshold: config.enter_threshold.max(1),
            exit_silence: config.exit_silence,
            recent: VecDeque::new(),
            last_signal: now,
            platform_driven: false,
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn status(&self) -> RegionStatus {
        self.status
    }

    /// Feed a sighting; non-matching beacons are ignored
    pub fn on_sighting(&mut self, sighting: &Sighting) -> Option<RegionTransition> {
        if !self.region.matches(&sighting.identity) {
            return None;
        }

        let seen_at = sighting.timestamp;
        self.platform_driven = false;
        self.last_signal = self.last_signal.max(seen_at);

        self.recent.push_back(seen_at);
        while let Some(&oldest) = self.recent.front() {
            if seen_at.saturating_duration_since(oldest) > self.enter_window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        if self.status != RegionStatus::Inside && self.recent.len() >= self.enter_threshold {
            return self.transition(RegionStatus::Inside);
        }
        None
    }

    pub fn on_platform_enter(&mut self, now: Instant) -> Option<RegionTransition> {
        self.platform_driven = true;
        self.last_signal = now;
        self.transition(RegionStatus::Inside)
    }

    pub fn on_platform_exit(&mut self, now: Instant) -> Option<RegionTransition> {
        self.platform_driven = false;
        self.last_signal = now;
        self.recent.clear();
        self.transition(RegionStatus::Outside)
    }

    /// Apply a state reported by the platform in response to a state request
    pub fn on_state_determined(
        &mut self,
        status: RegionStatus,
        now: Instant,
    ) -> Option<RegionTransition> {
        match status {
            RegionStatus::Inside => self.on_platform_enter(now),
            RegionStatus::Outside => self.on_platform_exit(now),
            RegionStatus::Unknown => None,
        }
    }

    /// Apply the silence timer
    pub fn tick(&mut self, now: Instant) -> Option<RegionTransition> {
        if self.platform_driven || self.status == RegionStatus::Outside {
            return None;
        }
        if now.saturating_duration_since(self.last_signal) >= self.exit_silence {
            self.recent.clear();
            return self.transition(RegionStatus::Outside);
        }
        None
    }

    fn transition(&mut self, next: RegionStatus) -> Option<RegionTransition> {
        if self.status == next {
            return None;
        }
        debug!(
            "Region {} transition {:?} -> {:?}",
            self.region, self.status, next
        );
        self.status = next;
        match next {
            RegionStatus::Inside => Some(RegionTransition::Entered),
            RegionStatus::Outside => Some(RegionTransition::Exited),
            RegionStatus::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BeaconIdentity, HardwareAddress, DEFAULT_PROXIMITY_UUID};

    fn sighting(major: u16, minor: u16, at: Instant) -> Sighting {
        Sighting {
            identity: BeaconIdentity::new(
                DEFAULT_PROXIMITY_UUID,
                major,
                minor,
                HardwareAddress::default(),
            ),
            measured_power: -59,
            rssi: -65,
            timestamp: at,
        }
    }

    fn config() -> MonitoringConfig {
        MonitoringConfig::default().with_exit_silence(Duration::from_secs(10))
    }

    #[test]
    fn test_home_region_enter_then_exit() {
        let t0 = Instant::now();
        let mut machine = RegionStateMachine::new(Region::new("home").major(1), &config(), t0);
        assert_eq!(machine.status(), RegionStatus::Unknown);

        let entered = machine.on_sighting(&sighting(1, 5, t0 + Duration::from_secs(1)));
        assert_eq!(entered, Some(RegionTransition::Entered));
        assert_eq!(machine.status(), RegionStatus::Inside);

        assert_eq!(machine.tick(t0 + Duration::from_secs(5)), None);
        let exited = machine.tick(t0 + Duration::from_secs(12));
        assert_eq!(exited, Some(RegionTransition::Exited));
        assert_eq!(machine.status(), RegionStatus::Outside);
        assert_eq!(machine.tick(t0 + Duration::from_secs(30)), None);
    }

    #[test]
    fn test_repeated_sightings_are_idempotent() {
        let t0 = Instant::now();
        let mut machine = RegionStateMachine::new(Region::new("home"), &config(), t0);

        let mut events = Vec::new();
        for i in 0..20 {
            let at = t0 + Duration::from_millis(500 * i);
            events.extend(machine.on_sighting(&sighting(1, 1, at)));
            events.extend(machine.tick(at));
        }
        events.extend(machine.tick(t0 + Duration::from_secs(60)));

        assert_eq!(
            events,
            vec![RegionTransition::Entered, RegionTransition::Exited]
        );
    }

    #[test]
    fn test_sightings_keep_region_alive() {
        let t0 = Instant::now();
        let mut machine = RegionStateMachine::new(Region::new("home"), &config(), t0);
        machine.on_sighting(&sighting(1, 1, t0));
        machine.on_sighting(&sighting(1, 1, t0 + Duration::from_secs(8)));
        assert_eq!(machine.tick(t0 + Duration::from_secs(15)), None);
        assert_eq!(
            machine.tick(t0 + Duration::from_secs(18)),
            Some(RegionTransition::Exited)
        );
    }

    #[test]
    fn test_non_matching_sighting_ignored() {
        let t0 = Instant::now();
        let mut machine = RegionStateMachine::new(Region::new("home").major(1), &config(), t0);
        assert_eq!(machine.on_sighting(&sighting(2, 5, t0)), None);
        assert_eq!(machine.status(), RegionStatus::Unknown);
    }

    #[test]
    fn test_enter_threshold_within_window() {
        let t0 = Instant::now();
        let config = config()
            .with_enter_threshold(3)
            .with_enter_window(Duration::from_secs(2));
        let mut machine = RegionStateMachine::new(Region::new("home"), &config, t0);

        // spread too thin for the window
        assert_eq!(machine.on_sighting(&sighting(1, 1, t0)), None);
        assert_eq!(machine.on_sighting(&sighting(1, 1, t0 + Duration::from_secs(3))), None);
        assert_eq!(machine.on_sighting(&sighting(1, 1, t0 + Duration::from_secs(6))), None);

        assert_eq!(machine.on_sighting(&sighting(1, 1, t0 + Duration::from_millis(6500))), None);
        assert_eq!(
            machine.on_sighting(&sighting(1, 1, t0 + Duration::from_millis(7000))),
            Some(RegionTransition::Entered)
        );
    }

    #[test]
    fn test_platform_exit_is_immediate() {
        let t0 = Instant::now();
        let mut machine = RegionStateMachine::new(Region::new("home"), &config(), t0);
        assert_eq!(machine.on_platform_enter(t0), Some(RegionTransition::Entered));
        assert_eq!(machine.on_platform_enter(t0), None);
        // platform-driven presence ignores the silence timer
        assert_eq!(machine.tick(t0 + Duration::from_secs(60)), None);
        assert_eq!(
            machine.on_platform_exit(t0 + Duration::from_secs(61)),
            Some(RegionTransition::Exited)
        );
    }

    #[test]
    fn test_state_determined() {
        let t0 = Instant::now();
        let mut machine = RegionStateMachine::new(Region::new("home"), &config(), t0);
        assert_eq!(machine.on_state_determined(RegionStatus::Unknown, t0), None);
        assert_eq!(
            machine.on_state_determined(RegionStatus::Outside, t0),
            Some(RegionTransition::Exited)
        );
        assert_eq!(machine.on_state_determined(RegionStatus::Outside, t0), None);
    }

    #[test]
    fn test_silence_from_registration_resolves_unknown() {
        let t0 = Instant::now();
        let mut machine = RegionStateMachine::new(Region::new("home"), &config(), t0);
        assert_eq!(machine.tick(t0 + Duration::from_secs(9)), None);
        assert_eq!(
            machine.tick(t0 + Duration::from_secs(10)),
            Some(RegionTransition::Exited)
        );
    }
}
