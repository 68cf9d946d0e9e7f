//! Proximity classification from signal strength
//!
//! Distance is estimated with the empirical path-loss curve commonly used for
//! iBeacon-format devices: the ratio of observed to calibrated power is raised to a
//! fitted exponent. The curve is strictly increasing in that ratio, so a stronger
//! signal never yields a larger distance or a farther class.

use serde::{Deserialize, Serialize};

/// Upper bound of the immediate class, in meters
pub const IMMEDIATE_RANGE_METERS: f64 = 0.5;
/// Upper bound of the near class, in meters
pub const NEAR_RANGE_METERS: f64 = 3.0;

/// Coarse distance class, ordered nearest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Proximity {
    Immediate,
    Near,
    Far,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityEstimate {
    pub proximity: Proximity,
    /// Estimated distance in meters; absent when the class is unknown
    pub distance: Option<f64>,
}

impl ProximityEstimate {
    pub const UNKNOWN: Self = Self {
        proximity: Proximity::Unknown,
        distance: None,
    };
}

/// Estimate distance in meters, or `None` when either reading is unusable
pub fn estimate_distance(measured_power: i8, rssi: i16) -> Option<f64> {
    if rssi >= 0 || measured_power >= 0 {
        return None;
    }

    let ratio = f64::from(rssi) / f64::from(measured_power);
    let distance = if ratio < 1.0 {
        ratio.powi(10)
    } else {
        0.89976 * ratio.powf(7.7095) + 0.111
    };

    distance.is_finite().then_some(distance)
}

pub fn classify(distance: f64) -> Proximity {
    if distance < IMMEDIATE_RANGE_METERS {
        Proximity::Immediate
    } else if distance < NEAR_RANGE_METERS {
        Proximity::Near
    } else {
        Proximity::Far
    }
}

pub fn estimate(measured_power: i8, rssi: i16) -> ProximityEstimate {
    match estimate_distance(measured_power, rssi) {
        Some(distance) => ProximityEstimate {
            proximity: classify(distance),
            distance: Some(distance),
        },
        None => ProximityEstimate::UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_rssi_is_unknown() {
        assert_eq!(estimate(-59, 0), ProximityEstimate::UNKNOWN);
        assert_eq!(estimate(-59, 12), ProximityEstimate::UNKNOWN);
        assert_eq!(estimate(0, -60), ProximityEstimate::UNKNOWN);
    }

    #[test]
    fn test_calibrated_power_is_about_one_meter() {
        let estimate = estimate(-59, -59);
        let distance = estimate.distance.unwrap();
        assert!((distance - 1.0108).abs() < 0.01);
        assert_eq!(estimate.proximity, Proximity::Near);
    }

    #[test]
    fn test_classes_by_strength() {
        assert_eq!(estimate(-59, -40).proximity, Proximity::Immediate);
        assert_eq!(estimate(-59, -65).proximity, Proximity::Near);
        assert_eq!(estimate(-59, -90).proximity, Proximity::Far);
    }

    proptest! {
        #[test]
        fn prop_stronger_signal_never_farther(
            measured in -100i8..=-20,
            weaker in -127i16..=-2,
            delta in 1i16..=100,
        ) {
            let stronger = (weaker + delta).min(-1);
            prop_assume!(stronger > weaker);

            let far = estimate(measured, weaker);
            let near = estimate(measured, stronger);
            prop_assert!(near.proximity <= far.proximity);
            prop_assert!(near.distance.unwrap() <= far.distance.unwrap());
        }
    }
}
