//! Messages exchanged between the HID daemon and the service.
//!
//! On the wire every message is an envelope `{"type": "INIT"|"UPDATE", "payload": {..}}`.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::battery::{BatteryReading, ChargeState};
use crate::device::DeviceType;

/// A device finished discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    pub id: String,
    pub name: String,
    pub has_battery: bool,
    pub device_type: DeviceType,
}

/// A new battery reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub id: String,
    pub percentage: f64,
    pub charge_state: ChargeState,
    pub millivolts: i32,
    pub mileage: f64,
    #[serde(rename = "timestampUtc", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl UpdateMessage {
    pub fn from_reading(id: &str, reading: &BatteryReading, timestamp: OffsetDateTime) -> Self {
        Self {
            id: id.to_string(),
            percentage: reading.percentage,
            charge_state: reading.charge_state,
            millivolts: reading.millivolts,
            mileage: reading.mileage,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpcMessage {
    Init(InitMessage),
    Update(UpdateMessage),
}

/// Message type key used to route subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Init,
    Update,
}

impl IpcMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Init(_) => MessageKind::Init,
            Self::Update(_) => MessageKind::Update,
        }
    }

    /// Cross-process identifier of the device the message is about.
    pub fn device_id(&self) -> &str {
        match self {
            Self::Init(m) => &m.id,
            Self::Update(m) => &m.id,
        }
    }
}
