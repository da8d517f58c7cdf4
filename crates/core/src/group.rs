//! Device groups: every HID interface of one physical container.
//!
//! A group collects the short, long and very-long HID++ handles of a receiver
//! or directly attached device. Once it holds both the short and the long
//! handle it starts: the channel begins reading, the receiver is asked to
//! announce its paired devices, and the receiver's own index is initialised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::comm::{HidHandle, HidppChannel};
use crate::device::{ContainerId, TransportKind};
use crate::engine;
use crate::error::{Error, Result};
use crate::hidpp::{DeviceConnection, RECEIVER_INDEX};
use crate::logical::{DeviceContext, LogicalDevice};

#[derive(Clone)]
struct Slot {
    path: String,
    handle: Arc<dyn HidHandle>,
}

#[derive(Default)]
struct Slots {
    short: Option<Slot>,
    long: Option<Slot>,
    very_long: Option<Slot>,
}

impl Slots {
    fn get_mut(&mut self, kind: TransportKind) -> Option<&mut Option<Slot>> {
        match kind {
            TransportKind::Short => Some(&mut self.short),
            TransportKind::Long => Some(&mut self.long),
            TransportKind::VeryLong => Some(&mut self.very_long),
            TransportKind::None => None,
        }
    }

    fn get(&self, kind: TransportKind) -> Option<&Slot> {
        match kind {
            TransportKind::Short => self.short.as_ref(),
            TransportKind::Long => self.long.as_ref(),
            TransportKind::VeryLong => self.very_long.as_ref(),
            TransportKind::None => None,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Slot> {
        [&self.short, &self.long, &self.very_long]
            .into_iter()
            .flatten()
    }

    /// One slot per distinct interface path.
    fn distinct(&self) -> Vec<Slot> {
        let mut seen: Vec<Slot> = Vec::new();
        for slot in self.iter() {
            if !seen.iter().any(|s| s.path == slot.path) {
                seen.push(slot.clone());
            }
        }
        seen
    }
}

pub struct DeviceGroup {
    container_id: ContainerId,
    context: DeviceContext,
    token: CancellationToken,
    slots: Mutex<Slots>,
    channel: OnceLock<Arc<HidppChannel>>,
    devices: Mutex<HashMap<u8, Arc<LogicalDevice>>>,
    tasks: Mutex<JoinSet<()>>,
    readers: Mutex<Vec<thread::JoinHandle<()>>>,
    started: AtomicBool,
}

impl DeviceGroup {
    pub fn new(container_id: ContainerId, context: DeviceContext, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            container_id,
            context,
            token: parent.child_token(),
            slots: Mutex::new(Slots::default()),
            channel: OnceLock::new(),
            devices: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            readers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Whether the `kind` slot is already filled.
    pub fn has_slot(&self, kind: TransportKind) -> bool {
        lock(&self.slots).get(kind).is_some()
    }

    /// Handle already open for `path` in another slot, if any.
    pub fn handle_for(&self, path: &str) -> Option<Arc<dyn HidHandle>> {
        lock(&self.slots)
            .iter()
            .find(|slot| slot.path == path)
            .map(|slot| Arc::clone(&slot.handle))
    }

    /// Put `handle` into the `kind` slot. Returns true when the slot was newly filled.
    pub fn assign(&self, kind: TransportKind, path: &str, handle: Arc<dyn HidHandle>) -> bool {
        let reader_needed = {
            let mut slots = lock(&self.slots);
            let reader_needed = !slots.iter().any(|s| s.path == path);
            let Some(slot) = slots.get_mut(kind) else {
                return false;
            };
            if slot.is_some() {
                return false;
            }
            *slot = Some(Slot {
                path: path.to_string(),
                handle: Arc::clone(&handle),
            });
            reader_needed
        };
        debug!(container = %self.container_id, ?kind, path, "Interface assigned");

        // Interfaces arriving after start still need their reports read.
        if reader_needed {
            if let Some(channel) = self.channel.get() {
                self.spawn_reader(channel, handle, path);
            }
        }
        true
    }

    /// True once both the short and the long handle are present.
    pub fn is_complete(&self) -> bool {
        let slots = lock(&self.slots);
        slots.short.is_some() && slots.long.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Start reading, enumerate paired devices and initialise the receiver's own index.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (writer, readers) = {
            let slots = lock(&self.slots);
            let writer = slots
                .short
                .as_ref()
                .map(|slot| Arc::clone(&slot.handle))
                .ok_or_else(|| Error::DeviceNotFound(format!("{}: no short interface", self.container_id)))?;
            (writer, slots.distinct())
        };
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (channel, notifications) = HidppChannel::new(writer);
        let channel = Arc::clone(self.channel.get_or_init(|| channel));
        for slot in readers {
            self.spawn_reader(&channel, slot.handle, &slot.path);
        }
        info!(container = %self.container_id, "Device group started");

        self.spawn(Arc::clone(self).watch_notifications(notifications));

        let transport = Arc::clone(&channel);
        let enumeration = tokio::task::spawn_blocking(move || -> Result<u8> {
            let connected = engine::connected_device_count(transport.as_ref())?;
            if connected > 0 {
                engine::announce_paired_devices(transport.as_ref())?;
            }
            Ok(connected)
        });
        match enumeration.await {
            Ok(Ok(connected)) => {
                info!(container = %self.container_id, connected, "Receiver enumerated")
            }
            Ok(Err(e)) => {
                debug!(container = %self.container_id, error = %e, "Not a receiver")
            }
            Err(e) => warn!(container = %self.container_id, error = %e, "Receiver enumeration failed"),
        }

        if let Some(receiver) = self.device(RECEIVER_INDEX) {
            receiver.init().await;
        }
        Ok(())
    }

    fn spawn_reader(&self, channel: &Arc<HidppChannel>, handle: Arc<dyn HidHandle>, path: &str) {
        let name = path.rsplit('/').next().unwrap_or(path);
        match channel.spawn_reader(handle, name) {
            Ok(reader) => lock(&self.readers).push(reader),
            Err(e) => warn!(path, error = %e, "Could not start reader thread"),
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    async fn watch_notifications(self: Arc<Self>, mut notifications: UnboundedReceiver<Vec<u8>>) {
        loop {
            let report = tokio::select! {
                _ = self.token.cancelled() => break,
                report = notifications.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
            };

            let Some(connection) = DeviceConnection::parse(&report) else {
                trace!(report_hex = format_args!("{:02X?}", report), "Unhandled notification");
                continue;
            };
            if !connection.link_established {
                debug!(
                    container = %self.container_id,
                    device_index = connection.device_index,
                    "Link lost"
                );
                continue;
            }

            debug!(
                container = %self.container_id,
                device_index = connection.device_index,
                wireless_pid = format_args!("0x{:04X}", connection.wireless_pid),
                "Device connected"
            );
            if let Some(device) = self.device(connection.device_index) {
                self.spawn(async move { device.init().await });
            }
        }
        trace!(container = %self.container_id, "Notification watcher exiting");
    }

    /// Get or create the logical device at `device_index`. `None` before start.
    pub fn device(&self, device_index: u8) -> Option<Arc<LogicalDevice>> {
        let channel = self.channel.get()?;
        let mut devices = lock(&self.devices);
        let device = devices.entry(device_index).or_insert_with(|| {
            LogicalDevice::new(
                device_index,
                Arc::clone(channel) as Arc<dyn crate::transport::HidTransport>,
                self.context.clone(),
                self.token.child_token(),
            )
        });
        Some(Arc::clone(device))
    }

    /// Every logical device created so far, ready or not.
    pub fn devices(&self) -> Vec<Arc<LogicalDevice>> {
        lock(&self.devices).values().cloned().collect()
    }

    /// Close the handles, stop every device and wait for the group's tasks.
    pub async fn shutdown(&self) {
        debug!(container = %self.container_id, "Shutting down device group");
        self.token.cancel();
        if let Some(channel) = self.channel.get() {
            channel.close();
        }

        for device in self.devices() {
            device.shutdown().await;
        }

        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(container = %self.container_id, error = %e, "Group task ended abnormally");
            }
        }

        let readers = std::mem::take(&mut *lock(&self.readers));
        let joined = tokio::task::spawn_blocking(move || {
            for reader in readers {
                if reader.join().is_err() {
                    warn!("HID++ reader thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(container = %self.container_id, error = %e, "Reader join failed");
        }

        *lock(&self.slots) = Slots::default();
        info!(container = %self.container_id, "Device group closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use crate::comm::fake::FakeHandle;
    use crate::config::PollSchedule;
    use crate::engine::fixtures::script_device;
    use crate::hidpp::features;
    use crate::ipc::IpcMessage;
    use crate::transport::mock::short_report;
    use crate::transport::PING_PAYLOAD;

    fn context() -> (DeviceContext, UnboundedReceiver<IpcMessage>) {
        let (events, rx) = unbounded_channel();
        let idle = Duration::from_secs(3600);
        (
            DeviceContext {
                disabled_devices: Arc::new(Vec::new()),
                schedule: PollSchedule {
                    settle: idle,
                    poll_period: idle,
                    retry_interval: idle,
                },
                events,
            },
            rx,
        )
    }

    /// Receiver that answers its own ping with a HID++ 1.0 error.
    fn receiver_handle(paired: u8) -> Arc<FakeHandle> {
        let handle = FakeHandle::new();
        handle.reply(
            short_report(RECEIVER_INDEX, 0x00, 0x11, &[0, 0, PING_PAYLOAD]),
            vec![0x10, RECEIVER_INDEX, 0x8F, 0x00, 0x11, 0x01, 0x00],
        );
        handle.reply(
            vec![0x10, 0xFF, 0x81, 0x02, 0x00, 0x00, 0x00],
            vec![0x10, 0xFF, 0x81, 0x02, 0x00, paired, 0x00],
        );
        handle
    }

    async fn next_init(rx: &mut UnboundedReceiver<IpcMessage>) -> crate::ipc::InitMessage {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(IpcMessage::Init(init)) => break init,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("no init event")
    }

    #[test]
    fn assign_reports_new_slots_only() {
        let (ctx, _rx) = context();
        let group = DeviceGroup::new("usb-1".into(), ctx, &CancellationToken::new());
        let short = FakeHandle::new();

        assert!(group.assign(TransportKind::Short, "/dev/hidraw1", short.clone()));
        assert!(!group.assign(TransportKind::Short, "/dev/hidraw1", short.clone()));
        assert!(!group.assign(TransportKind::None, "/dev/hidraw9", short));
        assert!(group.has_slot(TransportKind::Short));
        assert!(!group.is_complete());
        assert!(group.handle_for("/dev/hidraw1").is_some());
        assert!(group.handle_for("/dev/hidraw2").is_none());
    }

    #[test]
    fn device_requires_started_group() {
        let (ctx, _rx) = context();
        let group = DeviceGroup::new("usb-1".into(), ctx, &CancellationToken::new());
        assert!(group.device(0x01).is_none());
        assert!(group.devices().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_discovers_paired_device() {
        let (ctx, mut rx) = context();
        let short = receiver_handle(1);
        short.reply_all(
            vec![0x10, 0xFF, 0x80, 0x02, 0x02, 0x00, 0x00],
            vec![
                vec![0x10, 0xFF, 0x80, 0x02, 0x00, 0x00, 0x00],
                vec![0x10, 0x01, 0x41, 0x04, 0x01, 0x8D, 0x40],
            ],
        );
        script_device(short.as_ref(), 0x01, "MX Master 3", &[features::DEVICE_NAME, features::BATTERY_STATUS]);
        let long = FakeHandle::new();

        let group = DeviceGroup::new("usb-1".into(), ctx, &CancellationToken::new());
        assert!(group.assign(TransportKind::Short, "/dev/hidraw1", short));
        assert!(group.assign(TransportKind::Long, "/dev/hidraw2", long));
        assert!(group.is_complete());
        group.start().await.unwrap();

        let init = next_init(&mut rx).await;
        assert_eq!(init.name, "MX Master 3");
        assert!(init.has_battery);

        let mut indices: Vec<u8> = group.devices().iter().map(|d| d.device_index()).collect();
        indices.sort();
        assert_eq!(indices, vec![0x01, RECEIVER_INDEX]);
        assert!(!group.device(RECEIVER_INDEX).unwrap().is_ready());

        group.shutdown().await;
        assert!(!group.has_slot(TransportKind::Short));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn directly_attached_device_uses_receiver_index() {
        let (ctx, mut rx) = context();
        let short = FakeHandle::new();
        // Not a receiver: register read is refused.
        short.reply(
            vec![0x10, 0xFF, 0x81, 0x02, 0x00, 0x00, 0x00],
            vec![0x10, 0xFF, 0x8F, 0x81, 0x02, 0x01, 0x00],
        );
        script_device(short.as_ref(), RECEIVER_INDEX, "G502 HERO", &[features::DEVICE_NAME]);

        let group = DeviceGroup::new("usb-2".into(), ctx, &CancellationToken::new());
        group.assign(TransportKind::Short, "/dev/hidraw4", short.clone());
        group.assign(TransportKind::Long, "/dev/hidraw4", short);
        group.start().await.unwrap();

        let init = next_init(&mut rx).await;
        assert_eq!(init.name, "G502 HERO");
        assert!(!init.has_battery);
        assert!(group.device(RECEIVER_INDEX).unwrap().is_ready());

        group.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lost_link_does_not_create_device() {
        let (ctx, _rx) = context();
        let short = receiver_handle(0);
        let group = DeviceGroup::new("usb-3".into(), ctx, &CancellationToken::new());
        group.assign(TransportKind::Short, "/dev/hidraw1", short.clone());
        group.assign(TransportKind::Long, "/dev/hidraw2", FakeHandle::new());
        group.start().await.unwrap();

        short.inject(vec![0x10, 0x03, 0x41, 0x04, 0x41, 0x8D, 0x40]);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let indices: Vec<u8> = group.devices().iter().map(|d| d.device_index()).collect();
        assert_eq!(indices, vec![RECEIVER_INDEX]);
        group.shutdown().await;
    }
}
