//! Discovery and connection configuration

use std::time::Duration;

use beacon_core::{Attribute, MonitoringConfig};

// ----------------------------------------------------------------------------
// Write Policies
// ----------------------------------------------------------------------------

/// How a write transaction decides it succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WritePolicy {
    /// Platform acknowledgement followed by a matching read-back
    VerifyByReadback,
    /// Platform acknowledgement only
    FireAndForget,
}

/// Write policy per writable attribute
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WritePolicies {
    pub major: WritePolicy,
    pub minor: WritePolicy,
    pub power: WritePolicy,
    pub frequency: WritePolicy,
}

impl Default for WritePolicies {
    fn default() -> Self {
        Self {
            major: WritePolicy::VerifyByReadback,
            minor: WritePolicy::VerifyByReadback,
            power: WritePolicy::VerifyByReadback,
            frequency: WritePolicy::VerifyByReadback,
        }
    }
}

impl WritePolicies {
    /// Policy for `attribute`; read-only attributes have none
    pub fn for_attribute(&self, attribute: Attribute) -> Option<WritePolicy> {
        match attribute {
            Attribute::Major => Some(self.major),
            Attribute::Minor => Some(self.minor),
            Attribute::Power => Some(self.power),
            Attribute::Frequency => Some(self.frequency),
            Attribute::Battery | Attribute::HardwareVersion | Attribute::FirmwareVersion => None,
        }
    }

    /// Apply one policy to every writable attribute
    pub fn uniform(policy: WritePolicy) -> Self {
        Self {
            major: policy,
            minor: policy,
            power: policy,
            frequency: policy,
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Configuration for a beacon connection
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionConfig {
    /// Maximum time to wait for connection establishment
    pub connection_timeout: Duration,
    /// Maximum time for each characteristic operation
    pub transaction_timeout: Duration,
    /// Maximum time for each firmware source request
    pub download_timeout: Duration,
    /// Bytes per firmware transfer write
    pub firmware_chunk_size: usize,
    pub write_policies: WritePolicies,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            transaction_timeout: Duration::from_secs(5),
            download_timeout: Duration::from_secs(60),
            firmware_chunk_size: 20, // default ATT payload
            write_policies: WritePolicies::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Set firmware chunk size; zero is treated as one byte
    pub fn with_firmware_chunk_size(mut self, size: usize) -> Self {
        self.firmware_chunk_size = size.max(1);
        self
    }

    pub fn with_write_policies(mut self, policies: WritePolicies) -> Self {
        self.write_policies = policies;
        self
    }
}

// ----------------------------------------------------------------------------
// Discovery Configuration
// ----------------------------------------------------------------------------

/// Configuration for the discovery manager
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DiscoveryConfig {
    /// Capacity of the subscriber broadcast channel
    pub event_buffer_size: usize,
    /// Interval of the silence-timer sweep
    pub tick_interval: Duration,
    /// Bound on each scanner, region monitor and advertiser request
    pub platform_timeout: Duration,
    pub monitoring: MonitoringConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 64,
            tick_interval: Duration::from_secs(1),
            platform_timeout: Duration::from_secs(10),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set subscriber channel capacity; zero is treated as one
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size.max(1);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_platform_timeout(mut self, timeout: Duration) -> Self {
        self.platform_timeout = timeout;
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.monitoring = monitoring;
        self
    }
}
