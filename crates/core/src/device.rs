//! Device model: enumeration records, HID++ interface classification, device types.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::hidpp::{LONG_REPORT_LEN, SHORT_REPORT_LEN, VERY_LONG_REPORT_LEN};
use crate::LOGITECH_VID;

/// Vendor-defined usage pages carrying HID++ collections.
const HIDPP_USAGE_PAGES: [u16; 2] = [0xFF00, 0xFF43];

/// Identifier shared by every HID interface of one physical device.
pub type ContainerId = String;

/// Raw enumeration record for one HID interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    pub vid: u16,
    pub pid: u16,
    pub usage_page: u16,
    pub usage: u16,
    /// Input report length when the OS exposes it.
    pub input_report_len: Option<u16>,
    pub path: String,
    pub serial: Option<String>,
    /// Physical container the interface belongs to, if it could be resolved.
    pub container_id: Option<ContainerId>,
}

impl DeviceDescriptor {
    /// Container id, falling back to the interface path.
    pub fn container(&self) -> ContainerId {
        self.container_id.clone().unwrap_or_else(|| self.path.clone())
    }
}

/// HID++ report size an interface carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Not a HID++ interface.
    None,
    Short,
    Long,
    VeryLong,
}

/// Report ids of the HID++ short, long and very-long reports.
const HIDPP_REPORT_IDS: [u8; 3] = [0x10, 0x11, 0x12];

fn is_hidpp_page(usage_page: u16) -> bool {
    HIDPP_USAGE_PAGES.contains(&usage_page)
}

fn usage_kind(usage: u16) -> Option<TransportKind> {
    match usage {
        0x0001 => Some(TransportKind::Short),
        0x0002 | 0x0202 => Some(TransportKind::Long),
        0x0004 | 0x0204 => Some(TransportKind::VeryLong),
        _ => None,
    }
}

/// Classify a HID interface by its vendor usage, falling back to its report length.
pub fn classify(descriptor: &DeviceDescriptor) -> TransportKind {
    if !is_hidpp_page(descriptor.usage_page) {
        return TransportKind::None;
    }
    if let Some(kind) = usage_kind(descriptor.usage) {
        return kind;
    }
    match descriptor.input_report_len.map(usize::from) {
        Some(SHORT_REPORT_LEN) => TransportKind::Short,
        Some(LONG_REPORT_LEN) => TransportKind::Long,
        Some(VERY_LONG_REPORT_LEN) => TransportKind::VeryLong,
        _ => TransportKind::None,
    }
}

/// Input length, report id included, of the first HID++ report a HID report
/// descriptor declares. `None` for malformed descriptors or when no HID++
/// report id is present.
pub fn hidpp_input_report_len(report_descriptor: &[u8]) -> Option<u16> {
    let mut report_id = 0u8;
    let mut report_size = 0u32;
    let mut report_count = 0u32;
    let mut input_bits: Vec<(u8, u32)> = Vec::new();

    let mut pos = 0;
    while pos < report_descriptor.len() {
        let prefix = report_descriptor[pos];
        if prefix == 0xFE {
            // Long item: size byte, tag byte, data.
            let size = usize::from(*report_descriptor.get(pos + 1)?);
            pos += 3 + size;
            continue;
        }
        let size = match prefix & 0x03 {
            3 => 4,
            n => usize::from(n),
        };
        let data = report_descriptor.get(pos + 1..pos + 1 + size)?;
        let value = data
            .iter()
            .rev()
            .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));
        match prefix & 0xFC {
            0x74 => report_size = value,
            0x84 => report_id = u8::try_from(value).ok()?,
            0x94 => report_count = value,
            0x80 => {
                let bits = report_size.saturating_mul(report_count);
                match input_bits.iter_mut().find(|(id, _)| *id == report_id) {
                    Some((_, total)) => *total = total.saturating_add(bits),
                    None => input_bits.push((report_id, bits)),
                }
            }
            _ => {}
        }
        pos += 1 + size;
    }

    input_bits
        .into_iter()
        .find(|(id, _)| HIDPP_REPORT_IDS.contains(id))
        .and_then(|(_, bits)| u16::try_from(1 + bits.div_ceil(8)).ok())
}

/// HID++ device type code (feature 0x0005 function 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceType(pub u8);

impl DeviceType {
    pub const KEYBOARD: Self = Self(0);
    pub const MOUSE: Self = Self(3);
    pub const HEADSET: Self = Self(8);

    pub fn label(&self) -> &'static str {
        match self.0 {
            0 => "Keyboard",
            1 => "RemoteControl",
            2 => "Numpad",
            3 => "Mouse",
            4 => "Trackpad",
            5 => "Trackball",
            6 => "Presenter",
            7 => "Receiver",
            8 => "Headset",
            9 => "Webcam",
            10 => "SteeringWheel",
            11 => "Joystick",
            12 => "Gamepad",
            13 => "Dock",
            14 => "Speaker",
            15 => "Microphone",
            _ => "Unknown",
        }
    }
}

impl Default for DeviceType {
    fn default() -> Self {
        Self::MOUSE
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Enumerate every Logitech HID interface the OS currently exposes.
pub fn enumerate_logitech(api: &hidapi::HidApi) -> Vec<DeviceDescriptor> {
    let descriptors: Vec<_> = api
        .device_list()
        .filter(|info| info.vendor_id() == LOGITECH_VID)
        .map(|info| {
            let path = info.path().to_string_lossy().into_owned();
            let serial = info
                .serial_number()
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let container_id = resolve_container_id(
                &path,
                info.vendor_id(),
                info.product_id(),
                serial.as_deref(),
            );
            trace!(
                path = %path,
                pid = format_args!("0x{:04X}", info.product_id()),
                usage_page = format_args!("0x{:04X}", info.usage_page()),
                usage = format_args!("0x{:04X}", info.usage()),
                "Logitech interface"
            );
            DeviceDescriptor {
                vid: info.vendor_id(),
                pid: info.product_id(),
                usage_page: info.usage_page(),
                usage: info.usage(),
                input_report_len: if is_hidpp_page(info.usage_page())
                    && usage_kind(info.usage()).is_none()
                {
                    read_hidpp_report_len(api, info.path())
                } else {
                    None
                },
                path,
                serial,
                container_id: Some(container_id),
            }
        })
        .collect();

    debug!(count = descriptors.len(), "Logitech enumeration complete");
    descriptors
}

/// HID++ report length of an interface whose usage does not identify it.
fn read_hidpp_report_len(api: &hidapi::HidApi, path: &std::ffi::CStr) -> Option<u16> {
    let device = match api.open_path(path) {
        Ok(device) => device,
        Err(e) => {
            debug!(path = ?path, error = %e, "Cannot open interface for its report descriptor");
            return None;
        }
    };
    let mut buf = [0u8; hidapi::MAX_REPORT_DESCRIPTOR_SIZE];
    match device.get_report_descriptor(&mut buf) {
        Ok(len) => hidpp_input_report_len(&buf[..len]),
        Err(e) => {
            debug!(path = ?path, error = %e, "Report descriptor unavailable");
            None
        }
    }
}

/// Resolve the physical container for an interface.
///
/// On Linux the hidraw node's USB parent device in sysfs groups all of a
/// receiver's interfaces. Elsewhere vid/pid/serial is used when a serial is
/// available, otherwise the interface path itself.
pub fn resolve_container_id(path: &str, vid: u16, pid: u16, serial: Option<&str>) -> ContainerId {
    if let Some(container) = platform_container(path) {
        return container;
    }

    match serial {
        Some(serial) => format!("{vid:04x}:{pid:04x}:{serial}"),
        None => path.to_string(),
    }
}

#[cfg(not(target_os = "linux"))]
fn platform_container(_path: &str) -> Option<ContainerId> {
    None
}

#[cfg(target_os = "linux")]
fn platform_container(path: &str) -> Option<ContainerId> {
    let node = std::path::Path::new(path).file_name()?;
    let device = std::fs::canonicalize(
        std::path::Path::new("/sys/class/hidraw")
            .join(node)
            .join("device"),
    )
    .ok()?;
    // .../<usb-device>/<usb-interface>/<hid-device>
    let usb_device = device.parent()?.parent()?;
    Some(usb_device.to_string_lossy().into_owned())
}

/// Open an interface by path.
pub fn open_path(api: &hidapi::HidApi, path: &str) -> Result<hidapi::HidDevice> {
    let c_path = std::ffi::CString::new(path)
        .map_err(|e| Error::DeviceNotFound(format!("{path}: {e}")))?;
    api.open_path(&c_path)
        .map_err(|e| Error::Hid(format!("open {path}: {e}")))
}
