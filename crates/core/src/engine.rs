//! HID++ discovery for one logical device.
//!
//! Discovery runs synchronously over a [`HidTransport`]: ping handshake,
//! feature-map enumeration, identity population and battery variant selection.
//! A device that cannot be identified is rejected, which is an ordinary
//! outcome rather than an error.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, trace};

use crate::battery::BatteryVariant;
use crate::device::DeviceType;
use crate::error::Result;
use crate::hidpp::{features, registers, HidppRequest, RECEIVER_INDEX};
use crate::ipc::InitMessage;
use crate::safety;
use crate::transport::{hidpp_request, lookup_feature_index, ping, HidTransport};

/// Pings sent before the handshake gives up.
pub const PING_ATTEMPTS: usize = 10;
/// Consecutive successful pings required.
pub const PING_THRESHOLD: usize = 3;

/// Everything learned about a device during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    pub device_index: u8,
    /// Feature id → feature index.
    pub feature_map: HashMap<u16, u8>,
    pub name: String,
    pub device_type: DeviceType,
    /// Serial number, `unitId-modelId`, or a hash of the name.
    pub identifier: String,
    /// `None` for devices without a known battery feature.
    pub variant: Option<BatteryVariant>,
}

impl DeviceProfile {
    pub fn has_battery(&self) -> bool {
        self.variant.is_some()
    }

    pub fn init_message(&self) -> InitMessage {
        InitMessage {
            id: self.identifier.clone(),
            name: self.name.clone(),
            has_battery: self.has_battery(),
            device_type: self.device_type,
        }
    }
}

/// Why a device was abandoned during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Never answered enough consecutive pings.
    NoHandshake,
    /// Lacks the device name feature.
    NoIdentity,
    /// Name matched a disabled-device substring.
    Disabled { name: String, tag: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHandshake => write!(f, "ping handshake failed"),
            Self::NoIdentity => write!(f, "no device name feature"),
            Self::Disabled { name, tag } => write!(f, "{name} is disabled by \"{tag}\""),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    Ready(DeviceProfile),
    Rejected(Rejection),
}

/// Run full discovery for `device_index`.
///
/// Protocol failures after the handshake are returned as errors; the caller
/// decides whether that is fatal.
pub fn discover(
    transport: &dyn HidTransport,
    device_index: u8,
    disabled_devices: &[String],
) -> Result<InitOutcome> {
    if !ping_handshake(transport, device_index) {
        debug!(device_index, "Ping handshake failed");
        return Ok(InitOutcome::Rejected(Rejection::NoHandshake));
    }

    let feature_map = enumerate_features(transport, device_index)?;

    let Some(name_index) = addressable(&feature_map, features::DEVICE_NAME) else {
        return Ok(InitOutcome::Rejected(Rejection::NoIdentity));
    };
    let name = read_device_name(transport, device_index, name_index)?;
    if let Some(tag) = disabled_devices
        .iter()
        .find(|tag| !tag.is_empty() && name.contains(tag.as_str()))
    {
        info!(device_index, name = %name, "Device is marked as disabled");
        return Ok(InitOutcome::Rejected(Rejection::Disabled {
            name,
            tag: tag.clone(),
        }));
    }
    let device_type = read_device_type(transport, device_index, name_index)?;

    let identifier = match addressable(&feature_map, features::DEVICE_INFO) {
        Some(info_index) => read_identifier(transport, device_index, info_index)?,
        None => name_hash(&name),
    };

    let variant = BatteryVariant::select(&feature_map);
    debug!(
        device_index,
        identifier = %identifier,
        battery_feature = ?variant.map(|v| format!("0x{:04X}", v.feature_id())),
        "Battery variant selected"
    );

    Ok(InitOutcome::Ready(DeviceProfile {
        device_index,
        feature_map,
        name,
        device_type,
        identifier,
        variant,
    }))
}

/// Ping up to [`PING_ATTEMPTS`] times; true once [`PING_THRESHOLD`] consecutive pings succeed.
pub fn ping_handshake(transport: &dyn HidTransport, device_index: u8) -> bool {
    let mut consecutive = 0;
    for attempt in 1..=PING_ATTEMPTS {
        match ping(transport, device_index) {
            Ok(()) => {
                consecutive += 1;
                if consecutive >= PING_THRESHOLD {
                    return true;
                }
            }
            Err(e) => {
                trace!(device_index, attempt, error = %e, "Ping failed");
                consecutive = 0;
            }
        }
    }
    false
}

/// Build the feature map through IFeatureSet, visiting indices `0..=count`.
pub fn enumerate_features(
    transport: &dyn HidTransport,
    device_index: u8,
) -> Result<HashMap<u16, u8>> {
    let set_index = lookup_feature_index(transport, device_index, features::FEATURE_SET)?;

    let resp = hidpp_request(
        transport,
        &HidppRequest::new(device_index, set_index, 0x00, vec![]),
    )?;
    let count = resp.param(0)?;

    let mut feature_map = HashMap::with_capacity(usize::from(count) + 2);
    feature_map.insert(features::FEATURE_SET, set_index);
    for index in 0..=count {
        let resp = hidpp_request(
            transport,
            &HidppRequest::new(device_index, set_index, 0x01, vec![index]),
        )?;
        let id = resp.param_slice(0..2)?;
        let feature_id = u16::from_be_bytes([id[0], id[1]]);
        trace!(
            device_index,
            feature_id = format_args!("0x{:04X}", feature_id),
            feature_index = index,
            "Feature"
        );
        feature_map.insert(feature_id, index);
    }

    debug!(device_index, count, "Feature map built");
    Ok(feature_map)
}

/// Feature index for `feature_id` if the device has it and it may be addressed.
fn addressable(feature_map: &HashMap<u16, u8>, feature_id: u16) -> Option<u8> {
    safety::validate_feature_id(feature_id).ok()?;
    feature_map.get(&feature_id).copied()
}

fn read_device_name(transport: &dyn HidTransport, device_index: u8, feature_index: u8) -> Result<String> {
    let resp = hidpp_request(
        transport,
        &HidppRequest::new(device_index, feature_index, 0x00, vec![]),
    )?;
    let length = usize::from(resp.param(0)?);

    let mut raw = Vec::with_capacity(length);
    while raw.len() < length {
        let offset = raw.len() as u8;
        let resp = hidpp_request(
            transport,
            &HidppRequest::new(device_index, feature_index, 0x01, vec![offset]),
        )?;
        let take = resp.params.len().min(length - raw.len());
        if take == 0 {
            break;
        }
        raw.extend_from_slice(&resp.params[..take]);
    }

    Ok(String::from_utf8_lossy(&raw)
        .trim_end_matches('\0')
        .to_string())
}

fn read_device_type(transport: &dyn HidTransport, device_index: u8, feature_index: u8) -> Result<DeviceType> {
    let resp = hidpp_request(
        transport,
        &HidppRequest::new(device_index, feature_index, 0x02, vec![]),
    )?;
    Ok(DeviceType(resp.param(0)?))
}

/// Serial number when supported, otherwise `unitId-modelId`.
fn read_identifier(transport: &dyn HidTransport, device_index: u8, feature_index: u8) -> Result<String> {
    let info = hidpp_request(
        transport,
        &HidppRequest::new(device_index, feature_index, 0x00, vec![]),
    )?;
    let unit_id = hex_upper(info.param_slice(1..5)?);
    let model_id = hex_upper(info.param_slice(7..12)?);

    if info.param(14)? & 0x01 != 0 {
        let serial = hidpp_request(
            transport,
            &HidppRequest::new(device_index, feature_index, 0x02, vec![]),
        )?;
        return Ok(hex_upper(serial.param_slice(0..11)?));
    }
    Ok(format!("{unit_id}-{model_id}"))
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Four hex digit identifier derived from the device name (FNV-1a folded to 16 bits).
pub fn name_hash(name: &str) -> String {
    let mut hash: u32 = 0x811C_9DC5;
    for byte in name.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{:04X}", (hash >> 16) ^ (hash & 0xFFFF))
}

/// Number of devices paired and connected to a receiver.
pub fn connected_device_count(transport: &dyn HidTransport) -> Result<u8> {
    let req = HidppRequest::register(
        RECEIVER_INDEX,
        registers::GET_REGISTER,
        registers::CONNECTION_STATE,
        vec![],
    );
    hidpp_request(transport, &req)?.param(1)
}

/// Ask a receiver to emit a connection notification for every paired device.
pub fn announce_paired_devices(transport: &dyn HidTransport) -> Result<()> {
    let req = HidppRequest::register(
        RECEIVER_INDEX,
        registers::SET_REGISTER,
        registers::CONNECTION_STATE,
        vec![0x02],
    );
    hidpp_request(transport, &req)?;
    Ok(())
}
