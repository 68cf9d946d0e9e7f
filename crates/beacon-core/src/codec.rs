//! Beacon configuration characteristic codec
//!
//! Byte layouts of the configuration service:
//!
//! | Attribute         | Payload                                                  |
//! |-------------------|----------------------------------------------------------|
//! | major / minor     | `u16`, big-endian, as in the advertisement frame         |
//! | power             | one signed byte, dBm, restricted to [`TxPower`] levels   |
//! | frequency         | one byte, advertising interval in 10 ms units (1..=255)  |
//! | battery           | one byte, or a little-endian `u16`, percent              |
//! | hardware/firmware | UTF-8, NUL-terminated or filling at most 20 bytes        |
//!
//! Decoding a payload of the wrong length fails instead of guessing.

use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{BeaconError, BeaconResult};

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Beacon configuration GATT service
pub const CONFIG_SERVICE_UUID: Uuid = Uuid::from_u128(0xB9403000_F5F8_466E_AFF9_25556B57FE6D);

pub const MAJOR_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xB9403001_F5F8_466E_AFF9_25556B57FE6D);
pub const MINOR_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xB9403002_F5F8_466E_AFF9_25556B57FE6D);
pub const POWER_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xB9403011_F5F8_466E_AFF9_25556B57FE6D);
pub const FREQUENCY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xB9403012_F5F8_466E_AFF9_25556B57FE6D);
pub const BATTERY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xB9403041_F5F8_466E_AFF9_25556B57FE6D);
pub const HARDWARE_VERSION_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xB9403051_F5F8_466E_AFF9_25556B57FE6D);
pub const FIRMWARE_VERSION_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xB9403052_F5F8_466E_AFF9_25556B57FE6D);

/// Write-only characteristic receiving firmware image chunks
pub const FIRMWARE_TRANSFER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xB9403061_F5F8_466E_AFF9_25556B57FE6D);

/// Advertising interval unit carried by the frequency characteristic
pub const FREQUENCY_UNIT_MS: u16 = 10;

/// Longest version string a beacon reports
pub const MAX_VERSION_LEN: usize = 20;

// ----------------------------------------------------------------------------
// Attributes
// ----------------------------------------------------------------------------

/// Configurable or readable beacon attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    Major,
    Minor,
    Power,
    Frequency,
    Battery,
    HardwareVersion,
    FirmwareVersion,
}

impl Attribute {
    pub const ALL: [Attribute; 7] = [
        Attribute::Major,
        Attribute::Minor,
        Attribute::Power,
        Attribute::Frequency,
        Attribute::Battery,
        Attribute::HardwareVersion,
        Attribute::FirmwareVersion,
    ];

    pub fn characteristic(&self) -> Uuid {
        match self {
            Attribute::Major => MAJOR_CHARACTERISTIC_UUID,
            Attribute::Minor => MINOR_CHARACTERISTIC_UUID,
            Attribute::Power => POWER_CHARACTERISTIC_UUID,
            Attribute::Frequency => FREQUENCY_CHARACTERISTIC_UUID,
            Attribute::Battery => BATTERY_CHARACTERISTIC_UUID,
            Attribute::HardwareVersion => HARDWARE_VERSION_CHARACTERISTIC_UUID,
            Attribute::FirmwareVersion => FIRMWARE_VERSION_CHARACTERISTIC_UUID,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            Attribute::Major | Attribute::Minor | Attribute::Power | Attribute::Frequency
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Attribute::Major => "major",
            Attribute::Minor => "minor",
            Attribute::Power => "power",
            Attribute::Frequency => "frequency",
            Attribute::Battery => "battery",
            Attribute::HardwareVersion => "hardware version",
            Attribute::FirmwareVersion => "firmware version",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Typed Values
// ----------------------------------------------------------------------------

/// Transmit power levels supported by beacon firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TxPower {
    Minus30,
    Minus20,
    Minus16,
    Minus12,
    Minus8,
    Minus4,
    Zero,
    Plus4,
}

impl TxPower {
    pub const ALL: [TxPower; 8] = [
        TxPower::Minus30,
        TxPower::Minus20,
        TxPower::Minus16,
        TxPower::Minus12,
        TxPower::Minus8,
        TxPower::Minus4,
        TxPower::Zero,
        TxPower::Plus4,
    ];

    pub fn dbm(&self) -> i8 {
        match self {
            TxPower::Minus30 => -30,
            TxPower::Minus20 => -20,
            TxPower::Minus16 => -16,
            TxPower::Minus12 => -12,
            TxPower::Minus8 => -8,
            TxPower::Minus4 => -4,
            TxPower::Zero => 0,
            TxPower::Plus4 => 4,
        }
    }
}

impl TryFrom<i8> for TxPower {
    type Error = BeaconError;

    fn try_from(dbm: i8) -> BeaconResult<Self> {
        TxPower::ALL
            .into_iter()
            .find(|level| level.dbm() == dbm)
            .ok_or_else(|| BeaconError::unsupported(Attribute::Power.name(), format!("{} dBm", dbm)))
    }
}

impl fmt::Display for TxPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dBm", self.dbm())
    }
}

/// Advertising interval, a whole number of [`FREQUENCY_UNIT_MS`] steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdvertisingInterval(u8);

impl AdvertisingInterval {
    pub fn from_millis(millis: u16) -> BeaconResult<Self> {
        let units = millis / FREQUENCY_UNIT_MS;
        if millis % FREQUENCY_UNIT_MS != 0 || units == 0 || units > u8::MAX as u16 {
            return Err(BeaconError::unsupported(
                Attribute::Frequency.name(),
                format!("{} ms", millis),
            ));
        }
        Ok(Self(units as u8))
    }

    pub fn millis(&self) -> u16 {
        self.0 as u16 * FREQUENCY_UNIT_MS
    }
}

impl fmt::Display for AdvertisingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ms", self.millis())
    }
}

/// Battery charge in percent
///
/// Beacons occasionally report values above 100; those are clamped and flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatteryLevel {
    percent: u8,
    clamped: bool,
}

impl BatteryLevel {
    pub fn new(percent: u8) -> BeaconResult<Self> {
        if percent > 100 {
            return Err(BeaconError::unsupported(
                Attribute::Battery.name(),
                format!("{}%", percent),
            ));
        }
        Ok(Self {
            percent,
            clamped: false,
        })
    }

    pub fn from_raw(raw: u16) -> Self {
        Self {
            percent: raw.min(100) as u8,
            clamped: raw > 100,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn was_clamped(&self) -> bool {
        self.clamped
    }
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percent)
    }
}

/// A decoded characteristic value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    Major(u16),
    Minor(u16),
    Power(TxPower),
    Frequency(AdvertisingInterval),
    Battery(BatteryLevel),
    HardwareVersion(String),
    FirmwareVersion(String),
}

impl AttributeValue {
    pub fn attribute(&self) -> Attribute {
        match self {
            AttributeValue::Major(_) => Attribute::Major,
            AttributeValue::Minor(_) => Attribute::Minor,
            AttributeValue::Power(_) => Attribute::Power,
            AttributeValue::Frequency(_) => Attribute::Frequency,
            AttributeValue::Battery(_) => Attribute::Battery,
            AttributeValue::HardwareVersion(_) => Attribute::HardwareVersion,
            AttributeValue::FirmwareVersion(_) => Attribute::FirmwareVersion,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Major(v) | AttributeValue::Minor(v) => write!(f, "{}", v),
            AttributeValue::Power(p) => write!(f, "{}", p),
            AttributeValue::Frequency(i) => write!(f, "{}", i),
            AttributeValue::Battery(b) => write!(f, "{}", b),
            AttributeValue::HardwareVersion(s) | AttributeValue::FirmwareVersion(s) => {
                f.write_str(s)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

pub fn encode(value: &AttributeValue) -> BeaconResult<Vec<u8>> {
    match value {
        AttributeValue::Major(v) | AttributeValue::Minor(v) => Ok(v.to_be_bytes().to_vec()),
        AttributeValue::Power(p) => Ok(vec![p.dbm() as u8]),
        AttributeValue::Frequency(i) => Ok(vec![i.0]),
        AttributeValue::Battery(b) => Ok(vec![b.percent]),
        AttributeValue::HardwareVersion(s) | AttributeValue::FirmwareVersion(s) => {
            encode_version(value.attribute(), s)
        }
    }
}

fn encode_version(attribute: Attribute, version: &str) -> BeaconResult<Vec<u8>> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN || version.contains('\0') {
        return Err(BeaconError::unsupported(attribute.name(), version));
    }
    let mut bytes = version.as_bytes().to_vec();
    if bytes.len() < MAX_VERSION_LEN {
        bytes.push(0);
    }
    Ok(bytes)
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

pub fn decode(attribute: Attribute, payload: &[u8]) -> BeaconResult<AttributeValue> {
    match attribute {
        Attribute::Major => Ok(AttributeValue::Major(decode_u16(attribute, payload)?)),
        Attribute::Minor => Ok(AttributeValue::Minor(decode_u16(attribute, payload)?)),
        Attribute::Power => {
            let byte = single_byte(attribute, payload)?;
            Ok(AttributeValue::Power(TxPower::try_from(byte as i8)?))
        }
        Attribute::Frequency => {
            let units = single_byte(attribute, payload)?;
            if units == 0 {
                return Err(BeaconError::malformed(attribute.name(), "zero interval"));
            }
            Ok(AttributeValue::Frequency(AdvertisingInterval(units)))
        }
        Attribute::Battery => {
            let raw = match payload {
                [b] => *b as u16,
                [lo, hi] => u16::from_le_bytes([*lo, *hi]),
                _ => return Err(length_mismatch(attribute, "1 or 2", payload.len())),
            };
            Ok(AttributeValue::Battery(BatteryLevel::from_raw(raw)))
        }
        Attribute::HardwareVersion => {
            Ok(AttributeValue::HardwareVersion(decode_version(attribute, payload)?))
        }
        Attribute::FirmwareVersion => {
            Ok(AttributeValue::FirmwareVersion(decode_version(attribute, payload)?))
        }
    }
}

fn decode_u16(attribute: Attribute, payload: &[u8]) -> BeaconResult<u16> {
    let bytes: [u8; 2] = payload
        .try_into()
        .map_err(|_| length_mismatch(attribute, "2", payload.len()))?;
    Ok(u16::from_be_bytes(bytes))
}

fn single_byte(attribute: Attribute, payload: &[u8]) -> BeaconResult<u8> {
    match payload {
        [b] => Ok(*b),
        _ => Err(length_mismatch(attribute, "1", payload.len())),
    }
}

fn decode_version(attribute: Attribute, payload: &[u8]) -> BeaconResult<String> {
    if payload.is_empty() || payload.len() > MAX_VERSION_LEN {
        return Err(length_mismatch(
            attribute,
            &format!("1..={}", MAX_VERSION_LEN),
            payload.len(),
        ));
    }
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    if end == 0 {
        return Err(BeaconError::malformed(attribute.name(), "empty string"));
    }
    String::from_utf8(payload[..end].to_vec())
        .map_err(|e| BeaconError::malformed(attribute.name(), e.to_string()))
}

fn length_mismatch(attribute: Attribute, expected: &str, actual: usize) -> BeaconError {
    BeaconError::malformed(
        attribute.name(),
        format!("expected {} bytes, got {}", expected, actual),
    )
}
