//! Region monitoring and ranging configuration

use core::time::Duration;

// ----------------------------------------------------------------------------
// Monitoring Configuration
// ----------------------------------------------------------------------------

/// Timing and filtering knobs for region state machines and ranging sessions
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MonitoringConfig {
    /// Sliding window in which `enter_threshold` sightings confirm presence
    pub enter_window: Duration,
    /// Number of matching sightings within `enter_window` needed to enter
    pub enter_threshold: usize,
    /// Silence after which a sighting-driven region is considered exited
    pub exit_silence: Duration,
    /// Age after which a ranged beacon is dropped from snapshots
    pub ranging_staleness: Duration,
    /// Omit sightings whose proximity cannot be estimated from ranging snapshots
    pub avoid_unknown_proximity: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enter_window: Duration::from_secs(2),
            enter_threshold: 1,
            exit_silence: Duration::from_secs(10),
            ranging_staleness: Duration::from_secs(5),
            avoid_unknown_proximity: false,
        }
    }
}

impl MonitoringConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enter_window(mut self, window: Duration) -> Self {
        self.enter_window = window;
        self
    }

    /// Set the sighting count needed to enter; zero is treated as one
    pub fn with_enter_threshold(mut self, threshold: usize) -> Self {
        self.enter_threshold = threshold.max(1);
        self
    }

    pub fn with_exit_silence(mut self, silence: Duration) -> Self {
        self.exit_silence = silence;
        self
    }

    pub fn with_ranging_staleness(mut self, staleness: Duration) -> Self {
        self.ranging_staleness = staleness;
        self
    }

    pub fn with_avoid_unknown_proximity(mut self, enabled: bool) -> Self {
        self.avoid_unknown_proximity = enabled;
        self
    }
}
