//! Advertisement decoding
//!
//! Beacons broadcast the iBeacon manufacturer-specific layout:
//!
//! ```text
//! | company (LE u16) | 0x02 | 0x15 | proximity uuid (16) | major (BE u16) | minor (BE u16) | power (i8) |
//! ```
//!
//! Raw advertisements arrive as a sequence of length-prefixed AD structures. Anything
//! that does not carry the layout above is rejected with a malformed-payload error;
//! callers drop those silently since the channel is shared with unrelated devices.

use std::time::Instant;

use uuid::Uuid;

use crate::errors::{BeaconError, BeaconResult};
use crate::types::{BeaconIdentity, HardwareAddress, Sighting, VirtualBeacon};

/// Bluetooth SIG company identifier used by the iBeacon layout
pub const APPLE_COMPANY_ID: u16 = 0x004C;

const AD_TYPE_FLAGS: u8 = 0x01;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;
const IBEACON_TYPE: u8 = 0x02;
const IBEACON_DATA_LENGTH: u8 = 0x15;

/// Manufacturer data length after the company identifier
pub const IBEACON_PAYLOAD_LEN: usize = 2 + IBEACON_DATA_LENGTH as usize;

const CONTEXT: &str = "advertisement";

// ----------------------------------------------------------------------------
// Raw Advertisements
// ----------------------------------------------------------------------------

/// Advertisement as delivered by the platform scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub address: HardwareAddress,
    /// Concatenated AD structures
    pub payload: Vec<u8>,
    pub rssi: i16,
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Decode an advertisement into a sighting stamped with `seen_at`
pub fn decode_advertisement(raw: &RawAdvertisement, seen_at: Instant) -> BeaconResult<Sighting> {
    let mut rest = raw.payload.as_slice();

    while let Some((&length, tail)) = rest.split_first() {
        let length = length as usize;
        if length == 0 {
            // zero-length structure marks trailing padding
            break;
        }
        if tail.len() < length {
            return Err(BeaconError::malformed(
                CONTEXT,
                format!("AD structure of {} bytes overruns payload", length),
            ));
        }

        let (structure, next) = tail.split_at(length);
        if structure[0] == AD_TYPE_MANUFACTURER_DATA && structure.len() >= 3 {
            let company_id = u16::from_le_bytes([structure[1], structure[2]]);
            if company_id == APPLE_COMPANY_ID {
                return decode_manufacturer_data(
                    company_id,
                    &structure[3..],
                    raw.address,
                    raw.rssi,
                    seen_at,
                );
            }
        }
        rest = next;
    }

    Err(BeaconError::malformed(CONTEXT, "no beacon manufacturer data"))
}

/// Decode manufacturer data that has already been split from its company identifier
pub fn decode_manufacturer_data(
    company_id: u16,
    data: &[u8],
    address: HardwareAddress,
    rssi: i16,
    seen_at: Instant,
) -> BeaconResult<Sighting> {
    if company_id != APPLE_COMPANY_ID {
        return Err(BeaconError::malformed(
            CONTEXT,
            format!("unexpected company id {:#06x}", company_id),
        ));
    }
    if data.len() != IBEACON_PAYLOAD_LEN {
        return Err(BeaconError::malformed(
            CONTEXT,
            format!("expected {} bytes, got {}", IBEACON_PAYLOAD_LEN, data.len()),
        ));
    }
    if data[0] != IBEACON_TYPE || data[1] != IBEACON_DATA_LENGTH {
        return Err(BeaconError::malformed(
            CONTEXT,
            format!("not a beacon frame (prefix {})", hex::encode(&data[..2])),
        ));
    }

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&data[2..18]);
    let major = u16::from_be_bytes([data[18], data[19]]);
    let minor = u16::from_be_bytes([data[20], data[21]]);
    let measured_power = data[22] as i8;

    Ok(Sighting {
        identity: BeaconIdentity::new(Uuid::from_bytes(uuid), major, minor, address),
        measured_power,
        rssi,
        timestamp: seen_at,
    })
}

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

/// Manufacturer data (without company identifier) broadcast by a virtual beacon
pub fn encode_manufacturer_data(beacon: &VirtualBeacon) -> Vec<u8> {
    let mut data = Vec::with_capacity(IBEACON_PAYLOAD_LEN);
    data.push(IBEACON_TYPE);
    data.push(IBEACON_DATA_LENGTH);
    data.extend_from_slice(beacon.proximity_uuid.as_bytes());
    data.extend_from_slice(&beacon.major.to_be_bytes());
    data.extend_from_slice(&beacon.minor.to_be_bytes());
    data.push(beacon.measured_power as u8);
    data
}

/// Wrap manufacturer data in a single AD structure
pub fn manufacturer_structure(company_id: u16, data: &[u8]) -> Vec<u8> {
    let mut structure = Vec::with_capacity(data.len() + 4);
    structure.push((data.len() + 3) as u8);
    structure.push(AD_TYPE_MANUFACTURER_DATA);
    structure.extend_from_slice(&company_id.to_le_bytes());
    structure.extend_from_slice(data);
    structure
}

/// Complete advertisement payload: general-discoverable flags followed by the beacon frame
pub fn encode_advertisement(beacon: &VirtualBeacon) -> Vec<u8> {
    let mut payload = vec![0x02, AD_TYPE_FLAGS, 0x06];
    payload.extend(manufacturer_structure(
        APPLE_COMPANY_ID,
        &encode_manufacturer_data(beacon),
    ));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(payload: Vec<u8>) -> RawAdvertisement {
        RawAdvertisement {
            address: HardwareAddress::new([1, 2, 3, 4, 5, 6]),
            payload,
            rssi: -70,
        }
    }

    #[test]
    fn test_decode_beacon_frame() {
        let beacon = VirtualBeacon::new("test", 0x1234, 0xABCD);
        let now = Instant::now();
        let sighting = decode_advertisement(&raw(encode_advertisement(&beacon)), now).unwrap();

        assert_eq!(sighting.identity.proximity_uuid, beacon.proximity_uuid);
        assert_eq!(sighting.identity.major, 0x1234);
        assert_eq!(sighting.identity.minor, 0xABCD);
        assert_eq!(sighting.identity.address, HardwareAddress::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(sighting.measured_power, -59);
        assert_eq!(sighting.rssi, -70);
        assert_eq!(sighting.timestamp, now);
    }

    #[test]
    fn test_major_minor_are_big_endian_on_air() {
        let beacon = VirtualBeacon::new("test", 1, 5);
        let data = encode_manufacturer_data(&beacon);
        assert_eq!(&data[18..22], &[0x00, 0x01, 0x00, 0x05]);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let payload = encode_advertisement(&VirtualBeacon::new("test", 7, 8));
        let now = Instant::now();
        let first = decode_advertisement(&raw(payload.clone()), now).unwrap();
        let second = decode_advertisement(&raw(payload), now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_foreign_advertisements() {
        let now = Instant::now();
        // flags only
        assert!(decode_advertisement(&raw(vec![0x02, 0x01, 0x06]), now).is_err());
        // other vendor
        let other = manufacturer_structure(0x0059, &[0x02, 0x15, 0x00]);
        assert!(decode_advertisement(&raw(other), now).is_err());
        // truncated structure
        assert!(decode_advertisement(&raw(vec![0x1A, 0xFF, 0x4C, 0x00]), now).is_err());
        assert!(decode_advertisement(&raw(Vec::new()), now).is_err());
    }

    #[test]
    fn test_rejects_wrong_frame_length() {
        let mut data = encode_manufacturer_data(&VirtualBeacon::new("test", 1, 1));
        data.pop();
        let err = decode_manufacturer_data(
            APPLE_COMPANY_ID,
            &data,
            HardwareAddress::default(),
            -60,
            Instant::now(),
        )
        .unwrap_err();
        assert!(matches!(err, BeaconError::MalformedPayload { .. }));
    }

    #[test]
    fn test_ignores_trailing_padding() {
        let mut payload = encode_advertisement(&VirtualBeacon::new("test", 3, 4));
        payload.extend([0, 0, 0]);
        assert!(decode_advertisement(&raw(payload), Instant::now()).is_ok());
    }
}
