//! Hotplug detection by periodic re-enumeration.
//!
//! hidapi has no arrival/removal callbacks, so a watcher thread rescans the
//! Logitech interfaces on an interval and reports the difference to a
//! [`HotplugSink`]. The first scan reports every interface already present.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::{enumerate_logitech, DeviceDescriptor};
use crate::error::{Error, Result};

/// How often a sleeping watcher checks for cancellation.
const CANCEL_CHECK: Duration = Duration::from_millis(50);

/// Receiver of arrival and departure notifications. Implementations must not block.
pub trait HotplugSink: Send + Sync {
    fn on_arrive(&self, descriptor: DeviceDescriptor);
    fn on_depart(&self, descriptor: DeviceDescriptor);
}

/// Identity of one HID collection: several collections can share a path.
type InterfaceKey = (String, u16, u16);

fn key(descriptor: &DeviceDescriptor) -> InterfaceKey {
    (descriptor.path.clone(), descriptor.usage_page, descriptor.usage)
}

/// Interfaces present in `current` but not `previous`, and the reverse.
pub fn diff(
    previous: &HashMap<InterfaceKey, DeviceDescriptor>,
    current: &[DeviceDescriptor],
) -> (Vec<DeviceDescriptor>, Vec<DeviceDescriptor>) {
    let arrived = current
        .iter()
        .filter(|d| !previous.contains_key(&key(d)))
        .cloned()
        .collect();
    let still_present: Vec<InterfaceKey> = current.iter().map(key).collect();
    let departed = previous
        .iter()
        .filter(|(k, _)| !still_present.contains(k))
        .map(|(_, d)| d.clone())
        .collect();
    (arrived, departed)
}

pub struct HotplugWatcher {
    handle: thread::JoinHandle<()>,
}

impl HotplugWatcher {
    /// Start scanning every `interval` until `token` is cancelled.
    pub fn spawn(
        api: Arc<Mutex<hidapi::HidApi>>,
        sink: Arc<dyn HotplugSink>,
        interval: Duration,
        token: CancellationToken,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("hid-hotplug".into())
            .spawn(move || watch(&api, sink.as_ref(), interval, &token))
            .map_err(Error::Io)?;
        Ok(Self { handle })
    }

    /// Wait for the watcher thread to exit.
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("Hotplug watcher panicked");
        }
    }
}

fn watch(
    api: &Mutex<hidapi::HidApi>,
    sink: &dyn HotplugSink,
    interval: Duration,
    token: &CancellationToken,
) {
    let mut known: HashMap<InterfaceKey, DeviceDescriptor> = HashMap::new();
    while !token.is_cancelled() {
        match scan(api) {
            Ok(current) => {
                let (arrived, departed) = diff(&known, &current);
                for descriptor in departed {
                    debug!(path = %descriptor.path, "Interface departed");
                    known.remove(&key(&descriptor));
                    sink.on_depart(descriptor);
                }
                for descriptor in arrived {
                    debug!(path = %descriptor.path, "Interface arrived");
                    known.insert(key(&descriptor), descriptor.clone());
                    sink.on_arrive(descriptor);
                }
            }
            Err(e) => warn!(error = %e, "HID enumeration failed"),
        }

        let deadline = Instant::now() + interval;
        while !token.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(CANCEL_CHECK.min(deadline - now));
        }
    }
    debug!("Hotplug watcher stopped");
}

fn scan(api: &Mutex<hidapi::HidApi>) -> Result<Vec<DeviceDescriptor>> {
    let mut api = api.lock().unwrap_or_else(PoisonError::into_inner);
    api.refresh_devices()
        .map_err(|e| Error::Hid(format!("refresh devices: {e}")))?;
    Ok(enumerate_logitech(&api))
}
