//! Safety layer: restricts device traffic to the read-only telemetry features.
//!
//! lgstray only ever reads identity and battery data. Every feature lookup goes
//! through [`validate_feature_id`] so that nothing outside this allow-list
//! (firmware update, DFU, onboard memory) can be addressed by mistake.

use crate::error::{Error, Result};
use crate::hidpp::features;

/// HID++ feature IDs that lgstray is allowed to communicate with.
const ALLOWED_FEATURE_IDS: &[u16] = &[
    features::ROOT,            // 0x0000: ping and feature index lookup
    features::FEATURE_SET,     // 0x0001: enumerate features
    features::DEVICE_INFO,     // 0x0003: unit id, model id, serial
    features::DEVICE_NAME,     // 0x0005: device name and type
    features::BATTERY_STATUS,  // 0x1000
    features::BATTERY_VOLTAGE, // 0x1001
    features::UNIFIED_BATTERY, // 0x1004
];

/// Validate that a HID++ feature ID is in the allowed list.
pub fn validate_feature_id(feature_id: u16) -> Result<()> {
    if ALLOWED_FEATURE_IDS.contains(&feature_id) {
        Ok(())
    } else {
        Err(Error::FeatureNotAllowed(feature_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_features_allowed() {
        for id in [0x0000, 0x0001, 0x0003, 0x0005, 0x1000, 0x1001, 0x1004] {
            assert!(validate_feature_id(id).is_ok(), "0x{id:04X} should pass");
        }
    }

    #[test]
    fn configuration_features_rejected() {
        // DFU, adjustable DPI, onboard profiles
        for id in [0x00D0, 0x2201, 0x8100] {
            assert!(matches!(
                validate_feature_id(id),
                Err(Error::FeatureNotAllowed(_))
            ));
        }
    }
}
