//! Battery telemetry: readings and the three HID++ battery feature variants.
//!
//! A device supports at most one variant in practice, but when several are
//! advertised the choice is fixed: 0x1000 > 0x1001 > 0x1004.
//!
//! - 0x1000 BATTERY_STATUS, function 0 getBatteryLevelStatus:
//!   params[0] = level %, params[1] = next level, params[2] = status
//! - 0x1001 BATTERY_VOLTAGE, function 0 getBatteryInfo:
//!   params[0..2] = millivolts (big-endian), params[2] = flags
//! - 0x1004 UNIFIED_BATTERY, function 1 getStatus:
//!   params[0] = state of charge %, params[1] = level bitmask, params[2] = charging status

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hidpp::{features, HidppRequest, HidppResponse};
use crate::transport::{hidpp_request, HidTransport};

/// Power supply state reported alongside a battery level.
///
/// Serialized as its numeric code so existing snapshot readers keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum ChargeState {
    Discharging = 0,
    Charging = 1,
    Full = 2,
    NotCharging = 3,
    #[default]
    Unknown = 4,
}

impl From<ChargeState> for u8 {
    fn from(state: ChargeState) -> Self {
        state as u8
    }
}

impl From<u8> for ChargeState {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Discharging,
            1 => Self::Charging,
            2 => Self::Full,
            3 => Self::NotCharging,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Discharging => "discharging",
            Self::Charging => "charging",
            Self::Full => "full",
            Self::NotCharging => "not charging",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// One battery sample. Compared by value to suppress duplicate updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    /// 0 to 100, or -1 when unknown.
    pub percentage: f64,
    /// Millivolts, or -1 when the feature does not report voltage.
    pub millivolts: i32,
    /// Remaining mileage, or -1 when unknown.
    pub mileage: f64,
    pub charge_state: ChargeState,
}

impl BatteryReading {
    pub const UNKNOWN_PERCENTAGE: f64 = -1.0;
}

/// Battery feature family chosen for a device at init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryVariant {
    /// 0x1000 BATTERY_STATUS.
    Status { feature_index: u8 },
    /// 0x1001 BATTERY_VOLTAGE.
    Voltage { feature_index: u8 },
    /// 0x1004 UNIFIED_BATTERY.
    Unified { feature_index: u8 },
}

impl BatteryVariant {
    /// Pick the first supported variant in priority order 0x1000 > 0x1001 > 0x1004.
    pub fn select(feature_map: &HashMap<u16, u8>) -> Option<Self> {
        if let Some(&feature_index) = feature_map.get(&features::BATTERY_STATUS) {
            Some(Self::Status { feature_index })
        } else if let Some(&feature_index) = feature_map.get(&features::BATTERY_VOLTAGE) {
            Some(Self::Voltage { feature_index })
        } else {
            feature_map
                .get(&features::UNIFIED_BATTERY)
                .map(|&feature_index| Self::Unified { feature_index })
        }
    }

    /// HID++ feature ID this variant reads.
    pub fn feature_id(&self) -> u16 {
        match self {
            Self::Status { .. } => features::BATTERY_STATUS,
            Self::Voltage { .. } => features::BATTERY_VOLTAGE,
            Self::Unified { .. } => features::UNIFIED_BATTERY,
        }
    }

    /// Issue the feature-specific read and decode the reply.
    pub fn read(&self, transport: &dyn HidTransport, device_index: u8) -> Result<BatteryReading> {
        let req = match *self {
            Self::Status { feature_index } | Self::Voltage { feature_index } => {
                HidppRequest::new(device_index, feature_index, 0x00, vec![])
            }
            Self::Unified { feature_index } => {
                HidppRequest::new(device_index, feature_index, 0x01, vec![])
            }
        };
        let resp = hidpp_request(transport, &req)?;
        self.decode(&resp)
    }

    /// Decode a reply for this variant.
    pub fn decode(&self, resp: &HidppResponse) -> Result<BatteryReading> {
        match self {
            Self::Status { .. } => decode_status(resp),
            Self::Voltage { .. } => decode_voltage(resp),
            Self::Unified { .. } => decode_unified(resp),
        }
    }
}

fn decode_status(resp: &HidppResponse) -> Result<BatteryReading> {
    let level = resp.param(0)?;
    let charge_state = match resp.param(2)? {
        0 => ChargeState::Discharging,
        1 | 2 | 4 => ChargeState::Charging,
        3 => ChargeState::Full,
        5 | 6 => ChargeState::NotCharging,
        _ => ChargeState::Unknown,
    };
    Ok(BatteryReading {
        percentage: f64::from(level),
        millivolts: -1,
        mileage: -1.0,
        charge_state,
    })
}

fn decode_voltage(resp: &HidppResponse) -> Result<BatteryReading> {
    let raw = resp.param_slice(0..2)?;
    let millivolts = u16::from_be_bytes([raw[0], raw[1]]);
    let flags = resp.param(2)?;

    let charge_state = if flags & 0x80 == 0 {
        ChargeState::Discharging
    } else {
        match flags & 0x03 {
            0 => ChargeState::Charging,
            1 => ChargeState::Full,
            2 => ChargeState::NotCharging,
            _ => ChargeState::Unknown,
        }
    };

    Ok(BatteryReading {
        percentage: voltage_to_percentage(millivolts),
        millivolts: i32::from(millivolts),
        mileage: -1.0,
        charge_state,
    })
}

fn decode_unified(resp: &HidppResponse) -> Result<BatteryReading> {
    let state_of_charge = resp.param(0)?;
    let level = resp.param(1)?;

    // Devices without a state-of-charge gauge only report a coarse level.
    let percentage = if state_of_charge > 0 {
        f64::from(state_of_charge)
    } else if level & 0x08 != 0 {
        90.0
    } else if level & 0x04 != 0 {
        50.0
    } else if level & 0x02 != 0 {
        20.0
    } else if level & 0x01 != 0 {
        5.0
    } else {
        0.0
    };

    let charge_state = match resp.param(2)? {
        0 => ChargeState::Discharging,
        1 | 2 => ChargeState::Charging,
        3 => ChargeState::Full,
        4 => ChargeState::NotCharging,
        _ => ChargeState::Unknown,
    };

    Ok(BatteryReading {
        percentage,
        millivolts: -1,
        mileage: -1.0,
        charge_state,
    })
}

/// Li-ion discharge curve: (millivolts, percent), descending.
const DISCHARGE_CURVE: &[(u16, f64)] = &[
    (4186, 100.0),
    (4067, 90.0),
    (3989, 80.0),
    (3922, 70.0),
    (3859, 60.0),
    (3811, 50.0),
    (3778, 40.0),
    (3751, 30.0),
    (3717, 20.0),
    (3671, 10.0),
    (3646, 5.0),
    (3579, 2.0),
    (3500, 0.0),
];

/// Estimate charge percentage from cell voltage by linear interpolation.
pub fn voltage_to_percentage(millivolts: u16) -> f64 {
    let (top_mv, top_pct) = DISCHARGE_CURVE[0];
    if millivolts >= top_mv {
        return top_pct;
    }
    for pair in DISCHARGE_CURVE.windows(2) {
        let (hi_mv, hi_pct) = pair[0];
        let (lo_mv, lo_pct) = pair[1];
        if millivolts >= lo_mv {
            let span = f64::from(hi_mv - lo_mv);
            let offset = f64::from(millivolts - lo_mv);
            return (lo_pct + (hi_pct - lo_pct) * offset / span).round();
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    const DEV_IDX: u8 = 0x01;

    fn map(entries: &[(u16, u8)]) -> HashMap<u16, u8> {
        entries.iter().copied().collect()
    }

    #[test]
    fn selection_prefers_battery_status() {
        let features = map(&[(0x1004, 0x09), (0x1000, 0x06)]);
        assert_eq!(
            BatteryVariant::select(&features),
            Some(BatteryVariant::Status { feature_index: 0x06 })
        );
    }

    #[test]
    fn selection_prefers_voltage_over_unified() {
        let features = map(&[(0x1004, 0x09), (0x1001, 0x07)]);
        assert_eq!(
            BatteryVariant::select(&features),
            Some(BatteryVariant::Voltage { feature_index: 0x07 })
        );
    }

    #[test]
    fn selection_without_battery_feature_is_none() {
        let features = map(&[(0x0000, 0x00), (0x0001, 0x01), (0x0005, 0x02)]);
        assert_eq!(BatteryVariant::select(&features), None);
    }

    #[test]
    fn read_battery_status() {
        let mock = MockTransport::new();
        mock.on_short_request(DEV_IDX, 0x06, 0x01, &[], &[55, 50, 0x01]);
        let reading = BatteryVariant::Status { feature_index: 0x06 }
            .read(&mock, DEV_IDX)
            .unwrap();
        assert_eq!(reading.percentage, 55.0);
        assert_eq!(reading.millivolts, -1);
        assert_eq!(reading.charge_state, ChargeState::Charging);
    }

    #[test]
    fn read_battery_voltage() {
        let mock = MockTransport::new();
        // 3811 mV, external power, charge status full
        mock.on_short_request(DEV_IDX, 0x07, 0x01, &[], &[0x0E, 0xE3, 0x81]);
        let reading = BatteryVariant::Voltage { feature_index: 0x07 }
            .read(&mock, DEV_IDX)
            .unwrap();
        assert_eq!(reading.millivolts, 3811);
        assert_eq!(reading.percentage, 50.0);
        assert_eq!(reading.charge_state, ChargeState::Full);
    }

    #[test]
    fn read_unified_battery_uses_function_one() {
        let mock = MockTransport::new();
        mock.on_long_request(DEV_IDX, 0x09, 0x11, &[], &[72, 0x04, 0x00, 0x00]);
        let reading = BatteryVariant::Unified { feature_index: 0x09 }
            .read(&mock, DEV_IDX)
            .unwrap();
        assert_eq!(reading.percentage, 72.0);
        assert_eq!(reading.charge_state, ChargeState::Discharging);
    }

    #[test]
    fn unified_falls_back_to_level_bitmask() {
        let mock = MockTransport::new();
        mock.on_short_request(DEV_IDX, 0x09, 0x11, &[], &[0, 0x02, 0x03]);
        let reading = BatteryVariant::Unified { feature_index: 0x09 }
            .read(&mock, DEV_IDX)
            .unwrap();
        assert_eq!(reading.percentage, 20.0);
        assert_eq!(reading.charge_state, ChargeState::Full);
    }

    #[test]
    fn voltage_curve_bounds_and_interpolation() {
        assert_eq!(voltage_to_percentage(4300), 100.0);
        assert_eq!(voltage_to_percentage(3400), 0.0);
        assert_eq!(voltage_to_percentage(3859), 60.0);
        // halfway between 3811 (50%) and 3859 (60%)
        assert_eq!(voltage_to_percentage(3835), 55.0);
    }

    #[test]
    fn charge_state_serializes_as_code() {
        assert_eq!(serde_json::to_string(&ChargeState::Full).unwrap(), "2");
        let parsed: ChargeState = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, ChargeState::Charging);
    }
}
