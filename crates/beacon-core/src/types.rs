//! Beacon identities, regions and sightings

use core::fmt;
use core::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{BeaconError, BeaconResult};
use crate::proximity::{self, ProximityEstimate};

/// Proximity UUID broadcast by factory-configured beacons
pub const DEFAULT_PROXIMITY_UUID: Uuid = Uuid::from_u128(0xB9407F30_F5F8_466E_AFF9_25556B57FE6D);

// ----------------------------------------------------------------------------
// Hardware Address
// ----------------------------------------------------------------------------

/// 48-bit Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for HardwareAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| hex::encode_upper([*b])).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl FromStr for HardwareAddress {
    type Err = BeaconError;

    fn from_str(s: &str) -> BeaconResult<Self> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&digits)
            .map_err(|e| BeaconError::malformed("hardware address", e.to_string()))?;
        let bytes: [u8; 6] = bytes.try_into().map_err(|v: Vec<u8>| {
            BeaconError::malformed("hardware address", format!("expected 6 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

// ----------------------------------------------------------------------------
// Beacon Identity
// ----------------------------------------------------------------------------

/// Identity of a single physical beacon as seen over the air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeaconIdentity {
    pub proximity_uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    pub address: HardwareAddress,
}

impl BeaconIdentity {
    pub fn new(proximity_uuid: Uuid, major: u16, minor: u16, address: HardwareAddress) -> Self {
        Self {
            proximity_uuid,
            major,
            minor,
            address,
        }
    }
}

impl fmt::Display for BeaconIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} ({})",
            self.proximity_uuid, self.major, self.minor, self.address
        )
    }
}

// ----------------------------------------------------------------------------
// Regions
// ----------------------------------------------------------------------------

/// Matching criteria handed to the platform region monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionCriteria {
    pub proximity_uuid: Uuid,
    pub major: Option<u16>,
    pub minor: Option<u16>,
}

impl RegionCriteria {
    pub fn matches(&self, identity: &BeaconIdentity) -> bool {
        identity.proximity_uuid == self.proximity_uuid
            && self.major.map_or(true, |m| m == identity.major)
            && self.minor.map_or(true, |m| m == identity.minor)
    }
}

/// A caller-defined matching scope over beacon identities
///
/// Absent major/minor values are wildcards. A minor may only be set together with a
/// major; [`Region::validate`] rejects the inverse, which can only be produced by
/// deserialization since the constructors never build it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    identifier: String,
    proximity_uuid: Uuid,
    major: Option<u16>,
    minor: Option<u16>,
}

impl Region {
    /// Region matching every beacon with the default proximity UUID
    pub fn new(identifier: impl Into<String>) -> Self {
        Self::with_uuid(identifier, DEFAULT_PROXIMITY_UUID)
    }

    pub fn with_uuid(identifier: impl Into<String>, proximity_uuid: Uuid) -> Self {
        Self {
            identifier: identifier.into(),
            proximity_uuid,
            major: None,
            minor: None,
        }
    }

    /// Restrict the region to one major value
    pub fn major(mut self, major: u16) -> Self {
        self.major = Some(major);
        self
    }

    /// Restrict the region to a single major/minor pair
    pub fn major_minor(mut self, major: u16, minor: u16) -> Self {
        self.major = Some(major);
        self.minor = Some(minor);
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn proximity_uuid(&self) -> Uuid {
        self.proximity_uuid
    }

    pub fn major_value(&self) -> Option<u16> {
        self.major
    }

    pub fn minor_value(&self) -> Option<u16> {
        self.minor
    }

    pub fn criteria(&self) -> RegionCriteria {
        RegionCriteria {
            proximity_uuid: self.proximity_uuid,
            major: self.major,
            minor: self.minor,
        }
    }

    pub fn validate(&self) -> BeaconResult<()> {
        if self.identifier.is_empty() {
            return Err(BeaconError::InvalidRegion {
                identifier: String::new(),
                reason: "identifier must not be empty".to_string(),
            });
        }
        if self.minor.is_some() && self.major.is_none() {
            return Err(BeaconError::InvalidRegion {
                identifier: self.identifier.clone(),
                reason: "minor set without major".to_string(),
            });
        }
        Ok(())
    }

    pub fn matches(&self, identity: &BeaconIdentity) -> bool {
        self.criteria().matches(identity)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier)
    }
}

/// Whether the device is currently within a monitored region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RegionStatus {
    #[default]
    Unknown,
    Inside,
    Outside,
}

// ----------------------------------------------------------------------------
// Sightings
// ----------------------------------------------------------------------------

/// One observed advertisement
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub identity: BeaconIdentity,
    /// Calibrated signal strength at one meter, in dBm
    pub measured_power: i8,
    /// Observed signal strength, in dBm
    pub rssi: i16,
    pub timestamp: Instant,
}

impl Sighting {
    pub fn proximity(&self) -> ProximityEstimate {
        proximity::estimate(self.measured_power, self.rssi)
    }
}

// ----------------------------------------------------------------------------
// Virtual Beacon
// ----------------------------------------------------------------------------

/// Identity the local device broadcasts when acting as a beacon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBeacon {
    pub identifier: String,
    pub proximity_uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    pub measured_power: i8,
}

impl VirtualBeacon {
    pub fn new(identifier: impl Into<String>, major: u16, minor: u16) -> Self {
        Self {
            identifier: identifier.into(),
            proximity_uuid: DEFAULT_PROXIMITY_UUID,
            major,
            minor,
            measured_power: -59,
        }
    }

    /// Region that matches exactly this virtual beacon
    pub fn region(&self) -> Region {
        Region::with_uuid(self.identifier.clone(), self.proximity_uuid)
            .major_minor(self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(major: u16, minor: u16) -> BeaconIdentity {
        BeaconIdentity::new(DEFAULT_PROXIMITY_UUID, major, minor, HardwareAddress::default())
    }

    #[test]
    fn test_wildcard_region_matches_all() {
        let region = Region::new("all");
        assert!(region.matches(&identity(1, 2)));
        assert!(region.matches(&identity(9, 9)));
        assert!(!Region::with_uuid("other", Uuid::nil()).matches(&identity(1, 2)));
    }

    #[test]
    fn test_major_minor_region_matching() {
        let region = Region::new("home").major(1);
        assert!(region.matches(&identity(1, 5)));
        assert!(!region.matches(&identity(2, 5)));

        let exact = Region::new("desk").major_minor(1, 5);
        assert!(exact.matches(&identity(1, 5)));
        assert!(!exact.matches(&identity(1, 6)));
    }

    #[test]
    fn test_minor_without_major_is_invalid() {
        let region = Region {
            identifier: "bad".to_string(),
            proximity_uuid: DEFAULT_PROXIMITY_UUID,
            major: None,
            minor: Some(3),
        };
        assert!(matches!(
            region.validate(),
            Err(BeaconError::InvalidRegion { .. })
        ));
        assert!(Region::new("ok").major_minor(1, 3).validate().is_ok());
        assert!(Region::new("").validate().is_err());
    }

    #[test]
    fn test_hardware_address_display_and_parse() {
        let address = HardwareAddress::new([0xD0, 0x1F, 0x02, 0x3A, 0x4B, 0x5C]);
        assert_eq!(address.to_string(), "D0:1F:02:3A:4B:5C");
        assert_eq!("d0:1f:02:3a:4b:5c".parse::<HardwareAddress>().unwrap(), address);
        assert!("d0:1f".parse::<HardwareAddress>().is_err());
    }

    #[test]
    fn test_virtual_beacon_region() {
        let beacon = VirtualBeacon::new("me", 10, 20);
        let region = beacon.region();
        assert_eq!(region.identifier(), "me");
        assert_eq!(region.major_value(), Some(10));
        assert_eq!(region.minor_value(), Some(20));
    }
}
