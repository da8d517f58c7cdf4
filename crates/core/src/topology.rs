//! Topology manager: maps HID interfaces onto device groups.
//!
//! Hotplug callbacks only enqueue. A single worker thread owns the
//! path → container and container → group maps and processes every queued
//! command in order, so interface opens and feature-map builds never race.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::comm::{HidHandle, HidapiHandle};
use crate::device::{self, classify, ContainerId, DeviceDescriptor, TransportKind};
use crate::error::{Error, Result};
use crate::group::DeviceGroup;
use crate::hotplug::HotplugSink;
use crate::logical::{DeviceContext, LogicalDevice};

/// Opens OS handles for enumerated interfaces.
pub trait HidBackend: Send + Sync {
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn HidHandle>>;
}

/// [`HidBackend`] over a shared hidapi context.
pub struct HidapiBackend {
    api: Arc<Mutex<hidapi::HidApi>>,
}

impl HidapiBackend {
    pub fn new(api: Arc<Mutex<hidapi::HidApi>>) -> Self {
        Self { api }
    }
}

impl HidBackend for HidapiBackend {
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn HidHandle>> {
        let api = self.api.lock().unwrap_or_else(PoisonError::into_inner);
        let device = device::open_path(&api, &descriptor.path)?;
        Ok(Arc::new(HidapiHandle::new(device, descriptor.path.clone())))
    }
}

enum Command {
    Arrived(DeviceDescriptor),
    Departed(DeviceDescriptor),
    Devices(oneshot::Sender<Vec<Arc<LogicalDevice>>>),
    Containers(oneshot::Sender<Vec<ContainerId>>),
    Shutdown,
}

pub struct TopologyManager {
    queue: Sender<Command>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    token: CancellationToken,
}

impl TopologyManager {
    /// Start the worker thread. Groups run their async work on `runtime`.
    pub fn start(
        backend: Arc<dyn HidBackend>,
        context: DeviceContext,
        token: CancellationToken,
        runtime: Handle,
    ) -> Result<Self> {
        let (queue, commands) = mpsc::channel();
        let worker = Worker {
            backend,
            context,
            token: token.clone(),
            runtime,
            paths: HashMap::new(),
            groups: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name("hidpp-topology".into())
            .spawn(move || worker.run(commands))
            .map_err(Error::Io)?;

        Ok(Self {
            queue,
            worker: Mutex::new(Some(handle)),
            token,
        })
    }

    /// Queue an arrived interface. Never blocks.
    pub fn on_arrive(&self, descriptor: DeviceDescriptor) {
        self.enqueue(Command::Arrived(descriptor));
    }

    /// Queue a departed interface. Never blocks.
    pub fn on_depart(&self, descriptor: DeviceDescriptor) {
        self.enqueue(Command::Departed(descriptor));
    }

    fn enqueue(&self, command: Command) {
        if self.queue.send(command).is_err() {
            warn!("Topology worker has stopped, dropping command");
        }
    }

    /// Every logical device across every group.
    pub async fn devices(&self) -> Vec<Arc<LogicalDevice>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Command::Devices(tx));
        rx.await.unwrap_or_default()
    }

    /// Container ids currently tracked.
    pub async fn tracked_containers(&self) -> Vec<ContainerId> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Command::Containers(tx));
        rx.await.unwrap_or_default()
    }

    /// Poll every ready device now, concurrently, bypassing duplicate suppression.
    pub async fn force_battery_updates(&self) {
        let devices: Vec<_> = self
            .devices()
            .await
            .into_iter()
            .filter(|d| d.is_ready())
            .collect();
        info!(count = devices.len(), "Forcing battery updates");
        join_all(devices.iter().map(|d| d.update_battery(true))).await;
    }

    /// Stop the worker and close every group.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.enqueue(Command::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if tokio::task::spawn_blocking(move || worker.join()).await.is_err() {
                warn!("Topology worker join failed");
            }
        }
    }
}

impl HotplugSink for TopologyManager {
    fn on_arrive(&self, descriptor: DeviceDescriptor) {
        TopologyManager::on_arrive(self, descriptor);
    }

    fn on_depart(&self, descriptor: DeviceDescriptor) {
        TopologyManager::on_depart(self, descriptor);
    }
}

struct Worker {
    backend: Arc<dyn HidBackend>,
    context: DeviceContext,
    token: CancellationToken,
    runtime: Handle,
    paths: HashMap<String, ContainerId>,
    groups: HashMap<ContainerId, Arc<DeviceGroup>>,
}

impl Worker {
    fn run(mut self, commands: Receiver<Command>) {
        debug!("Topology worker started");
        while let Ok(command) = commands.recv() {
            match command {
                Command::Arrived(descriptor) => {
                    if self.token.is_cancelled() {
                        continue;
                    }
                    match panic::catch_unwind(AssertUnwindSafe(|| self.arrive(&descriptor))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(path = %descriptor.path, error = %e, "Interface setup failed")
                        }
                        Err(_) => error!(path = %descriptor.path, "Interface setup panicked"),
                    }
                }
                Command::Departed(descriptor) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| self.depart(&descriptor))).is_err() {
                        error!(path = %descriptor.path, "Interface teardown panicked");
                    }
                }
                Command::Devices(reply) => {
                    let devices = self.groups.values().flat_map(|g| g.devices()).collect();
                    if reply.send(devices).is_err() {
                        trace!("Device list dropped, caller gone");
                    }
                }
                Command::Containers(reply) => {
                    if reply.send(self.groups.keys().cloned().collect()).is_err() {
                        trace!("Container list dropped, caller gone");
                    }
                }
                Command::Shutdown => break,
            }
        }

        for (_, group) in self.groups.drain() {
            self.runtime.block_on(group.shutdown());
        }
        self.paths.clear();
        debug!("Topology worker stopped");
    }

    fn arrive(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        let kind = classify(descriptor);
        if kind == TransportKind::None {
            trace!(path = %descriptor.path, "Not a HID++ interface");
            return Ok(());
        }

        let container = descriptor.container();
        let existing = self.groups.get(&container).cloned();
        if existing.as_ref().is_some_and(|group| group.has_slot(kind)) {
            debug!(path = %descriptor.path, ?kind, "Slot already filled");
            return Ok(());
        }

        // A group only exists once one of its interfaces opened.
        let handle = match existing.as_ref().and_then(|group| group.handle_for(&descriptor.path)) {
            Some(handle) => handle,
            None => self.backend.open(descriptor)?,
        };
        let group = existing.unwrap_or_else(|| {
            info!(container = %container, "Device group created");
            let group = DeviceGroup::new(container.clone(), self.context.clone(), &self.token);
            self.groups.insert(container.clone(), Arc::clone(&group));
            group
        });
        self.paths.insert(descriptor.path.clone(), container);

        let newly_assigned = group.assign(kind, &descriptor.path, handle);
        let starts_group = matches!(kind, TransportKind::Short | TransportKind::Long);
        if newly_assigned && starts_group && group.is_complete() && !group.is_started() {
            self.runtime.block_on(group.start())?;
        }
        Ok(())
    }

    fn depart(&mut self, descriptor: &DeviceDescriptor) {
        let Some(container) = self.paths.remove(&descriptor.path) else {
            trace!(path = %descriptor.path, "Departed interface was not tracked");
            return;
        };
        self.paths.retain(|_, c| *c != container);
        if let Some(group) = self.groups.remove(&container) {
            info!(container = %container, "Device group removed");
            self.runtime.block_on(group.shutdown());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use crate::comm::fake::FakeHandle;
    use crate::config::PollSchedule;
    use crate::engine::fixtures::{script_device, Script};
    use crate::hidpp::{features, RECEIVER_INDEX};
    use crate::ipc::IpcMessage;
    use crate::transport::mock::short_report;
    use crate::LOGITECH_VID;

    /// Opens scripted handles by path and records the open order.
    #[derive(Default)]
    struct FakeBackend {
        handles: Mutex<HashMap<String, Arc<FakeHandle>>>,
        opened: Mutex<Vec<String>>,
        slow: HashSet<String>,
        failing: HashSet<String>,
    }

    impl FakeBackend {
        fn with_handle(self, path: &str, handle: Arc<FakeHandle>) -> Self {
            self.handles.lock().unwrap().insert(path.into(), handle);
            self
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    impl HidBackend for FakeBackend {
        fn open(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn HidHandle>> {
            if self.slow.contains(&descriptor.path) {
                thread::sleep(Duration::from_millis(50));
            }
            if self.failing.contains(&descriptor.path) {
                return Err(Error::Hid(format!("open {}: access denied", descriptor.path)));
            }
            self.opened.lock().unwrap().push(descriptor.path.clone());
            let handle = self
                .handles
                .lock()
                .unwrap()
                .get(&descriptor.path)
                .cloned()
                .unwrap_or_else(FakeHandle::unplugged);
            Ok(handle)
        }
    }

    fn descriptor(path: &str, usage: u16, container: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            vid: LOGITECH_VID,
            pid: 0xC539,
            usage_page: 0xFF00,
            usage,
            input_report_len: None,
            path: path.into(),
            serial: None,
            container_id: Some(container.into()),
        }
    }

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

    fn manager(backend: Arc<FakeBackend>) -> (TopologyManager, UnboundedReceiver<IpcMessage>) {
        let (ctx, rx) = context();
        let manager =
            TopologyManager::start(backend, ctx, CancellationToken::new(), Handle::current()).unwrap();
        (manager, rx)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn arrivals_are_processed_in_order() {
        let backend = Arc::new(FakeBackend {
            slow: HashSet::from(["/dev/hidraw-a".to_string()]),
            ..Default::default()
        });
        let (manager, _rx) = manager(Arc::clone(&backend));

        manager.on_arrive(descriptor("/dev/hidraw-a", 0x0001, "A"));
        manager.on_arrive(descriptor("/dev/hidraw-b", 0x0001, "B"));

        wait_for(|| backend.opened().len() == 2).await;
        assert_eq!(backend.opened(), vec!["/dev/hidraw-a", "/dev/hidraw-b"]);

        let mut containers = manager.tracked_containers().await;
        containers.sort();
        assert_eq!(containers, vec!["A", "B"]);
        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_open_does_not_stop_worker() {
        let backend = Arc::new(FakeBackend {
            failing: HashSet::from(["/dev/hidraw-bad".to_string()]),
            ..Default::default()
        });
        let (manager, _rx) = manager(Arc::clone(&backend));

        manager.on_arrive(descriptor("/dev/hidraw-bad", 0x0001, "BAD"));
        manager.on_arrive(descriptor("/dev/hidraw-ok", 0x0001, "OK"));

        wait_for(|| backend.opened() == vec!["/dev/hidraw-ok".to_string()]).await;
        // The container whose only interface failed to open is not tracked.
        assert_eq!(manager.tracked_containers().await, vec!["OK"]);
        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_hidpp_interfaces_are_ignored() {
        let backend = Arc::new(FakeBackend::default());
        let (manager, _rx) = manager(Arc::clone(&backend));

        let mut keyboard = descriptor("/dev/hidraw-kbd", 0x0006, "K");
        keyboard.usage_page = 0x0001;
        manager.on_arrive(keyboard);

        assert!(manager.tracked_containers().await.is_empty());
        assert!(backend.opened().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn departure_closes_group() {
        let backend = Arc::new(FakeBackend::default());
        let (manager, _rx) = manager(Arc::clone(&backend));

        manager.on_arrive(descriptor("/dev/hidraw-s", 0x0001, "C"));
        manager.on_arrive(descriptor("/dev/hidraw-l", 0x0002, "C"));
        assert_eq!(manager.tracked_containers().await, vec!["C"]);
        assert!(manager
            .devices()
            .await
            .iter()
            .any(|d| d.device_index() == RECEIVER_INDEX));

        // Untracked departures are ignored.
        manager.on_depart(descriptor("/dev/hidraw-x", 0x0001, "X"));
        manager.on_depart(descriptor("/dev/hidraw-l", 0x0002, "C"));
        assert!(manager.tracked_containers().await.is_empty());
        assert!(manager.devices().await.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn force_battery_updates_emits_for_every_ready_device() {
        let handle = FakeHandle::new();
        handle.reply(
            vec![0x10, 0xFF, 0x81, 0x02, 0x00, 0x00, 0x00],
            vec![0x10, 0xFF, 0x8F, 0x81, 0x02, 0x01, 0x00],
        );
        let map = script_device(
            handle.as_ref(),
            RECEIVER_INDEX,
            "G703",
            &[features::DEVICE_NAME, features::BATTERY_STATUS],
        );
        let battery = map[&features::BATTERY_STATUS];
        handle.on(
            short_report(RECEIVER_INDEX, battery, 0x01, &[]),
            short_report(RECEIVER_INDEX, battery, 0x01, &[40, 0, 0]),
        );
        let backend = Arc::new(FakeBackend::default().with_handle("/dev/hidraw7", handle));
        let (manager, mut rx) = manager(Arc::clone(&backend));

        manager.on_arrive(descriptor("/dev/hidraw7", 0x0001, "D"));
        manager.on_arrive(descriptor("/dev/hidraw7", 0x0002, "D"));
        let init = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no init event");
        assert!(matches!(init, Some(IpcMessage::Init(_))));
        // Both collections share one node, opened once.
        assert_eq!(backend.opened(), vec!["/dev/hidraw7".to_string()]);

        manager.force_battery_updates().await;
        match rx.try_recv() {
            Ok(IpcMessage::Update(update)) => assert_eq!(update.percentage, 40.0),
            other => panic!("expected update, got {other:?}"),
        }

        manager.force_battery_updates().await;
        assert!(matches!(rx.try_recv(), Ok(IpcMessage::Update(_))));
        manager.shutdown().await;
    }
}
