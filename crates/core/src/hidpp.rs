//! HID++ wire format.
//!
//! Reports come in three sizes, selected by the first byte:
//! 0x10 short (7 bytes), 0x11 long (20 bytes), 0x12 very long (64 bytes).
//!
//! Every report shares the header `[reportId, deviceIdx, featureIdx, function|swId]`.
//! HID++ 1.0 register access reuses the same header with a sub-id in place of
//! the feature index and a register address in place of the function byte.

use crate::error::{Error, Result};

pub const SHORT_REPORT_ID: u8 = 0x10;
pub const LONG_REPORT_ID: u8 = 0x11;
pub const VERY_LONG_REPORT_ID: u8 = 0x12;

/// Report sizes, report id included.
pub const SHORT_REPORT_LEN: usize = 7;
pub const LONG_REPORT_LEN: usize = 20;
pub const VERY_LONG_REPORT_LEN: usize = 64;

/// Software ID placed in the low nibble of every request's function byte.
pub const SOFTWARE_ID: u8 = 0x01;

/// Device index addressing the receiver itself (or a directly attached device).
pub const RECEIVER_INDEX: u8 = 0xFF;

/// Feature index used by HID++ 2.0 error replies.
pub const HIDPP20_ERROR: u8 = 0xFF;
/// Sub-id used by HID++ 1.0 error replies.
pub const HIDPP10_ERROR: u8 = 0x8F;

/// HID++ 2.0 feature IDs used for identity and battery telemetry.
pub mod features {
    /// Ping and feature id → index lookup.
    pub const ROOT: u16 = 0x0000;
    /// IFeatureSet: feature count and id at each index.
    pub const FEATURE_SET: u16 = 0x0001;
    /// Unit id, model id, serial number.
    pub const DEVICE_INFO: u16 = 0x0003;
    /// Marketing name and device type.
    pub const DEVICE_NAME: u16 = 0x0005;
    pub const BATTERY_STATUS: u16 = 0x1000;
    pub const BATTERY_VOLTAGE: u16 = 0x1001;
    pub const UNIFIED_BATTERY: u16 = 0x1004;
}

/// HID++ 1.0 sub-ids and registers used on receivers.
pub mod registers {
    /// Set short register.
    pub const SET_REGISTER: u8 = 0x80;
    /// Get short register.
    pub const GET_REGISTER: u8 = 0x81;
    /// Receiver connection state register.
    pub const CONNECTION_STATE: u8 = 0x02;
    /// Device connection notification sub-id.
    pub const DEVICE_CONNECTION: u8 = 0x41;
}

/// Outgoing HID++ message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidppRequest {
    /// 0xFF addresses the receiver or a directly attached device.
    pub device_index: u8,
    pub feature_index: u8,
    /// Function in the high nibble, software id in the low nibble.
    pub function_sw: u8,
    pub params: Vec<u8>,
}

impl HidppRequest {
    /// Feature request: `function` is shifted into the high nibble next to [`SOFTWARE_ID`].
    pub fn new(device_index: u8, feature_index: u8, function: u8, params: Vec<u8>) -> Self {
        Self {
            device_index,
            feature_index,
            function_sw: (function << 4) | SOFTWARE_ID,
            params,
        }
    }

    /// Create a HID++ 1.0 register request (`sub_id` is get/set register).
    pub fn register(device_index: u8, sub_id: u8, address: u8, params: Vec<u8>) -> Self {
        Self {
            device_index,
            feature_index: sub_id,
            function_sw: address,
            params,
        }
    }

    /// Serialize, choosing the short form when three or fewer parameter bytes are set.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (report_id, len) = match self.params.len() {
            0..=3 => (SHORT_REPORT_ID, SHORT_REPORT_LEN),
            4..=16 => (LONG_REPORT_ID, LONG_REPORT_LEN),
            other => {
                return Err(Error::MalformedReply(format!(
                    "request carries {other} parameter bytes (maximum 16)"
                )))
            }
        };

        let mut report = Vec::with_capacity(len);
        report.extend_from_slice(&[report_id, self.device_index, self.feature_index, self.function_sw]);
        report.extend_from_slice(&self.params);
        report.resize(len, 0);
        Ok(report)
    }
}

/// Incoming HID++ report, split into header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidppResponse {
    pub report_id: u8,
    pub device_index: u8,
    pub feature_index: u8,
    pub function_sw: u8,
    /// Everything after the header, up to the report's nominal size.
    pub params: Vec<u8>,
}

impl HidppResponse {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let Some(&report_id) = data.first() else {
            return Err(Error::MalformedReply("empty report".into()));
        };
        let len = report_len(report_id).ok_or_else(|| {
            Error::MalformedReply(format!("report id 0x{report_id:02X} is not HID++"))
        })?;
        if data.len() < len {
            return Err(Error::MalformedReply(format!(
                "report 0x{report_id:02X} needs {len} bytes, got {}",
                data.len()
            )));
        }

        Ok(Self {
            report_id,
            device_index: data[1],
            feature_index: data[2],
            function_sw: data[3],
            params: data[4..len].to_vec(),
        })
    }

    pub fn function(&self) -> u8 {
        self.function_sw >> 4
    }

    /// Parameter byte at `i`, or a malformed-reply error if the report is too short.
    pub fn param(&self, i: usize) -> Result<u8> {
        self.params.get(i).copied().ok_or_else(|| {
            Error::MalformedReply(format!(
                "parameter {i} missing from {}-byte payload",
                self.params.len()
            ))
        })
    }

    /// Parameter bytes `range`, or a malformed-reply error if the report is too short.
    pub fn param_slice(&self, range: std::ops::Range<usize>) -> Result<&[u8]> {
        let len = self.params.len();
        self.params.get(range.clone()).ok_or_else(|| {
            Error::MalformedReply(format!(
                "parameters {}..{} missing from {len}-byte payload",
                range.start, range.end
            ))
        })
    }

    /// HID++ 2.0 (0xFF) or HID++ 1.0 (0x8F) error report.
    pub fn is_error(&self) -> bool {
        self.feature_index == HIDPP20_ERROR || self.feature_index == HIDPP10_ERROR
    }

    /// Error code carried by an error report.
    ///
    /// Error layout: `[errSubId, failedFeatureIdx, failedFunctionSw, code]`.
    pub fn error_code(&self) -> u8 {
        self.params.get(1).copied().unwrap_or(0)
    }
}

/// Total report length for a HID++ report ID.
pub fn report_len(report_id: u8) -> Option<usize> {
    match report_id {
        SHORT_REPORT_ID => Some(SHORT_REPORT_LEN),
        LONG_REPORT_ID => Some(LONG_REPORT_LEN),
        VERY_LONG_REPORT_ID => Some(VERY_LONG_REPORT_LEN),
        _ => None,
    }
}

/// Whether `reply` answers `request` (same header, or an error report naming it).
pub fn reply_matches(request: &[u8], reply: &[u8]) -> bool {
    if request.len() < 4 || reply.len() < 5 || request[1] != reply[1] {
        return false;
    }
    if reply[2] == request[2] && reply[3] == request[3] {
        return true;
    }
    (reply[2] == HIDPP20_ERROR || reply[2] == HIDPP10_ERROR)
        && reply[3] == request[2]
        && reply[4] == request[3]
}

/// A receiver "device connection" notification (HID++ 1.0 sub-id 0x41).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConnection {
    /// Index of the paired device the notification is about.
    pub device_index: u8,
    /// False when the receiver reports the link as lost.
    pub link_established: bool,
    /// Wireless product id.
    pub wireless_pid: u16,
}

impl DeviceConnection {
    /// Parse a raw report, returning `None` for anything that isn't a 0x41 notification.
    pub fn parse(report: &[u8]) -> Option<Self> {
        if report.len() < SHORT_REPORT_LEN
            || report[0] != SHORT_REPORT_ID
            || report[2] != registers::DEVICE_CONNECTION
        {
            return None;
        }
        Some(Self {
            device_index: report[1],
            link_established: report[4] & 0x40 == 0,
            wireless_pid: u16::from_le_bytes([report[5], report[6]]),
        })
    }
}
