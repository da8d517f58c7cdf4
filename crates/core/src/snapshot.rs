//! Device list snapshots published through a shared-memory region.
//!
//! Region layout: `[u16 LE length][UTF-8 JSON device list]` inside a fixed
//! 4096-byte file mapping. Payloads longer than [`MAX_PAYLOAD`] are cut to fit;
//! the length prefix always carries the number of bytes actually written.
//! Departed devices stay in the list.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;

use memmap2::{Mmap, MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::battery::ChargeState;
use crate::device::DeviceType;
use crate::error::{Error, Result};
use crate::ipc::IpcMessage;

/// Region written by the service on every device message.
pub const SERVICE_REGION: &str = "LGS_Devices";
/// Region written periodically for the presentation tier.
pub const PRESENTATION_REGION: &str = "LGSTray_DeviceList";

pub const REGION_SIZE: usize = 4096;
pub const MAX_PAYLOAD: usize = REGION_SIZE - 2;

/// Presentation view of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub has_battery: bool,
    pub battery_percentage: f64,
    pub battery_voltage: f64,
    pub battery_mileage: f64,
    pub power_supply_status: ChargeState,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
}

impl DeviceRecord {
    fn new(id: &str, name: &str, device_type: DeviceType, has_battery: bool) -> Self {
        Self {
            device_id: id.to_string(),
            device_name: name.to_string(),
            device_type,
            has_battery,
            battery_percentage: -1.0,
            battery_voltage: 0.0,
            battery_mileage: 0.0,
            power_supply_status: ChargeState::Unknown,
            last_update: None,
        }
    }

    pub fn is_charging(&self) -> bool {
        self.power_supply_status == ChargeState::Charging
    }

    /// Status document served for a single device.
    pub fn to_xml(&self) -> String {
        let last_update = self
            .last_update
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_default();
        let charging = if self.is_charging() { "True" } else { "False" };
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<xml>\n\
             <device_id>{}</device_id>\n\
             <device_name>{}</device_name>\n\
             <device_type>{}</device_type>\n\
             <battery_percent>{:.2}</battery_percent>\n\
             <battery_voltage>{:.2}</battery_voltage>\n\
             <mileage>{:.2}</mileage>\n\
             <charging>{}</charging>\n\
             <last_update>{}</last_update>\n</xml>",
            escape_xml(&self.device_id),
            escape_xml(&self.device_name),
            self.device_type.label(),
            self.battery_percentage,
            self.battery_voltage,
            self.battery_mileage,
            charging,
            last_update,
        )
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Known devices in discovery order.
#[derive(Debug, Default)]
pub struct DeviceStore {
    records: Vec<DeviceRecord>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one message into the list. Returns whether anything changed.
    pub fn apply(&mut self, message: &IpcMessage) -> bool {
        match message {
            IpcMessage::Init(init) => {
                match self.records.iter_mut().find(|r| r.device_id == init.id) {
                    Some(record) => {
                        record.device_name = init.name.clone();
                        record.device_type = init.device_type;
                        record.has_battery = init.has_battery;
                    }
                    None => {
                        trace!(id = %init.id, name = %init.name, "New device recorded");
                        self.records.push(DeviceRecord::new(
                            &init.id,
                            &init.name,
                            init.device_type,
                            init.has_battery,
                        ));
                    }
                }
                true
            }
            IpcMessage::Update(update) => {
                let Some(record) = self.records.iter_mut().find(|r| r.device_id == update.id) else {
                    trace!(id = %update.id, "Update for unknown device ignored");
                    return false;
                };
                record.battery_percentage = update.percentage;
                record.battery_voltage = f64::from(update.millivolts);
                record.battery_mileage = update.mileage;
                record.power_supply_status = update.charge_state;
                record.last_update = Some(update.timestamp);
                true
            }
        }
    }

    pub fn records(&self) -> &[DeviceRecord] {
        &self.records
    }

    /// Look up by device id, falling back to the device name.
    pub fn find(&self, id_or_name: &str) -> Option<&DeviceRecord> {
        find_record(&self.records, id_or_name)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.records)?)
    }
}

/// Look up by device id, falling back to the device name.
pub fn find_record<'a>(records: &'a [DeviceRecord], id_or_name: &str) -> Option<&'a DeviceRecord> {
    records
        .iter()
        .find(|r| r.device_id == id_or_name)
        .or_else(|| records.iter().find(|r| r.device_name == id_or_name))
}

/// Write `payload` behind its length prefix. Returns the payload bytes written.
pub fn encode_region(payload: &[u8], region: &mut [u8]) -> usize {
    let len = payload.len().min(MAX_PAYLOAD).min(region.len().saturating_sub(2));
    region[..2].copy_from_slice(&(len as u16).to_le_bytes());
    region[2..2 + len].copy_from_slice(&payload[..len]);
    len
}

/// The length-prefixed payload, or `None` when the prefix overruns the region.
pub fn decode_region(region: &[u8]) -> Option<&[u8]> {
    let prefix = region.get(..2)?;
    let len = u16::from_le_bytes([prefix[0], prefix[1]]) as usize;
    region.get(2..2 + len)
}

pub fn region_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// Writable mapping of a named region.
pub struct SharedRegion {
    map: MmapMut,
    path: PathBuf,
}

impl SharedRegion {
    /// Create the region file (or reuse an existing one) and map it.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        let path = region_path(dir, name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::SharedMemory(format!("{}: {e}", path.display())))?;
        file.set_len(REGION_SIZE as u64)?;
        // SAFETY: the file is sized to REGION_SIZE above; other processes only
        // ever read it, so the mapping is never truncated underneath us.
        let map = unsafe { MmapOptions::new().len(REGION_SIZE).map_mut(&file) }
            .map_err(|e| Error::SharedMemory(format!("map {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Shared memory region mapped");
        Ok(Self { map, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_payload(&mut self, payload: &[u8]) -> Result<usize> {
        let written = encode_region(payload, &mut self.map);
        if written < payload.len() {
            debug!(size = payload.len(), written, "Snapshot truncated to fit region");
        }
        self.map
            .flush()
            .map_err(|e| Error::SharedMemory(format!("flush {}: {e}", self.path.display())))?;
        Ok(written)
    }
}

/// Single-writer publisher. A request arriving during a write makes the
/// in-flight writer run once more instead of waiting for the lock.
pub struct SnapshotWriter {
    region: Mutex<SharedRegion>,
    pending: AtomicBool,
}

impl SnapshotWriter {
    pub fn new(region: SharedRegion) -> Self {
        Self {
            region: Mutex::new(region),
            pending: AtomicBool::new(false),
        }
    }

    /// Write the current contents of `store`.
    pub fn publish(&self, store: &Mutex<DeviceStore>) {
        self.pending.store(true, Ordering::SeqCst);
        loop {
            let mut region = match self.region.try_lock() {
                Ok(region) => region,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            while self.pending.swap(false, Ordering::SeqCst) {
                let payload = store
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .to_payload();
                match payload.and_then(|p| region.write_payload(&p)) {
                    Ok(written) => trace!(written, "Shared memory updated"),
                    Err(e) => warn!(error = %e, "Shared memory update failed"),
                }
            }
            drop(region);
            if !self.pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

/// Raw payload of a region, or `None` if it is absent or malformed.
pub fn read_payload(dir: &Path, name: &str) -> Option<Vec<u8>> {
    let path = region_path(dir, name);
    let file = std::fs::File::open(&path).ok()?;
    // SAFETY: read-only mapping; a concurrent writer can at worst produce a
    // torn payload, which fails to decode and is reported as no data.
    let map = unsafe { Mmap::map(&file) }.ok()?;
    decode_region(&map).map(<[u8]>::to_vec)
}

/// Device list from a region. Empty when there is no usable data.
pub fn read_devices(dir: &Path, name: &str) -> Vec<DeviceRecord> {
    let Some(payload) = read_payload(dir, name) else {
        return Vec::new();
    };
    if payload.is_empty() {
        return Vec::new();
    }
    serde_json::from_slice(&payload).unwrap_or_else(|e| {
        debug!(error = %e, "Snapshot payload not decodable");
        Vec::new()
    })
}

/// Keep `store` in step with the bus and write the service region after every message.
///
/// `messages` comes from [`crate::bus::EventBus::subscribe`], taken before the
/// publishers start so nothing is missed.
pub async fn run_snapshot_service(
    mut messages: broadcast::Receiver<IpcMessage>,
    store: Arc<Mutex<DeviceStore>>,
    writer: Arc<SnapshotWriter>,
    token: CancellationToken,
) {
    let mut writes = JoinSet::new();
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = messages.recv() => message,
        };
        match message {
            Ok(message) => {
                store
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .apply(&message);
                let (store, writer) = (Arc::clone(&store), Arc::clone(&writer));
                writes.spawn_blocking(move || writer.publish(&store));
                while writes.try_join_next().is_some() {}
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Snapshot service fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
    while writes.join_next().await.is_some() {}
    debug!("Snapshot service stopped");
}

/// Rewrite a region from `store` every `period` until cancelled.
pub async fn run_periodic_writer(
    store: Arc<Mutex<DeviceStore>>,
    writer: Arc<SnapshotWriter>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let (store, writer) = (Arc::clone(&store), Arc::clone(&writer));
        if tokio::task::spawn_blocking(move || writer.publish(&store))
            .await
            .is_err()
        {
            warn!("Periodic snapshot write panicked");
        }
    }
}
