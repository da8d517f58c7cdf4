//! One logical HID++ device behind a group's channel, and its polling loop.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::battery::BatteryReading;
use crate::config::PollSchedule;
use crate::engine::{self, DeviceProfile, InitOutcome};
use crate::ipc::{IpcMessage, UpdateMessage};
use crate::transport::HidTransport;

/// Settings and outputs shared by every logical device.
#[derive(Clone)]
pub struct DeviceContext {
    pub disabled_devices: Arc<Vec<String>>,
    pub schedule: PollSchedule,
    pub events: UnboundedSender<IpcMessage>,
}

#[derive(Default)]
struct PollState {
    last_update: Option<Instant>,
    last_reading: Option<BatteryReading>,
}

pub struct LogicalDevice {
    device_index: u8,
    transport: Arc<dyn HidTransport>,
    context: DeviceContext,
    token: CancellationToken,
    init_lock: tokio::sync::Mutex<()>,
    profile: OnceLock<DeviceProfile>,
    state: Mutex<PollState>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl LogicalDevice {
    pub fn new(
        device_index: u8,
        transport: Arc<dyn HidTransport>,
        context: DeviceContext,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_index,
            transport,
            context,
            token,
            init_lock: tokio::sync::Mutex::new(()),
            profile: OnceLock::new(),
            state: Mutex::new(PollState::default()),
            poller: Mutex::new(None),
        })
    }

    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    /// Discovery result, once the device is ready.
    pub fn profile(&self) -> Option<&DeviceProfile> {
        self.profile.get()
    }

    pub fn is_ready(&self) -> bool {
        self.profile.get().is_some()
    }

    pub fn last_reading(&self) -> Option<BatteryReading> {
        self.state().last_reading
    }

    /// Discover the device, announce it and start polling.
    ///
    /// Failures are logged and leave the device not ready. Concurrent callers
    /// are serialized; once the device is ready further calls return at once.
    pub async fn init(self: &Arc<Self>) {
        let _guard = self.init_lock.lock().await;
        if self.is_ready() || self.token.is_cancelled() {
            return;
        }

        let device_index = self.device_index;
        let transport = Arc::clone(&self.transport);
        let disabled = Arc::clone(&self.context.disabled_devices);
        let discovery = tokio::task::spawn_blocking(move || {
            engine::discover(transport.as_ref(), device_index, &disabled)
        });

        let profile = match discovery.await {
            Ok(Ok(InitOutcome::Ready(profile))) => profile,
            Ok(Ok(InitOutcome::Rejected(reason))) => {
                debug!(device_index, reason = %reason, "Device rejected");
                return;
            }
            Ok(Err(e)) => {
                warn!(device_index, error = %e, "Device discovery failed");
                return;
            }
            Err(e) => {
                error!(device_index, error = %e, "Discovery task failed");
                return;
            }
        };

        info!(
            device_index,
            name = %profile.name,
            identifier = %profile.identifier,
            device_type = %profile.device_type,
            has_battery = profile.has_battery(),
            "Device ready"
        );
        let init = IpcMessage::Init(profile.init_message());
        let has_battery = profile.has_battery();
        if self.profile.set(profile).is_err() {
            debug!(device_index, "Device already initialised");
            return;
        }
        self.emit(init);

        if has_battery {
            let handle = tokio::spawn(Arc::clone(self).poll_loop());
            *self.poller.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let schedule = self.context.schedule;
        if self.pause(schedule.settle).await {
            return;
        }

        loop {
            let due = self
                .state()
                .last_update
                .map_or_else(Instant::now, |at| at + schedule.poll_period);
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep_until(due) => {}
            }

            self.update_battery(false).await;

            if self.pause(schedule.retry_interval).await {
                return;
            }
        }
    }

    /// Sleep for `duration`; true if cancelled first.
    async fn pause(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Read the battery once and emit an Update when the reading changed or `force` is set.
    pub async fn update_battery(&self, force: bool) {
        if self.token.is_cancelled() {
            return;
        }
        let Some(profile) = self.profile.get() else {
            return;
        };
        let Some(variant) = profile.variant else {
            return;
        };

        let device_index = self.device_index;
        let transport = Arc::clone(&self.transport);
        let read = tokio::task::spawn_blocking(move || variant.read(transport.as_ref(), device_index));

        let reading = match read.await {
            Ok(Ok(reading)) => reading,
            Ok(Err(e)) => {
                debug!(device_index, error = %e, "Battery read failed, skipping cycle");
                return;
            }
            Err(e) => {
                error!(device_index, error = %e, "Battery read task failed");
                return;
            }
        };

        let changed = {
            let mut state = self.state();
            state.last_update = Some(Instant::now());
            if !force && state.last_reading == Some(reading) {
                false
            } else {
                state.last_reading = Some(reading);
                true
            }
        };

        if !changed {
            trace!(device_index, "Battery unchanged");
            return;
        }
        debug!(
            device_index,
            percentage = reading.percentage,
            charge_state = %reading.charge_state,
            forced = force,
            "Battery update"
        );
        self.emit(IpcMessage::Update(UpdateMessage::from_reading(
            &profile.identifier,
            &reading,
            OffsetDateTime::now_utc(),
        )));
    }

    /// Stop polling and wait for the loop to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = poller {
            if let Err(e) = handle.await {
                warn!(device_index = self.device_index, error = %e, "Poll loop ended abnormally");
            }
        }
    }

    fn emit(&self, message: IpcMessage) {
        if self.context.events.send(message).is_err() {
            trace!(device_index = self.device_index, "No event listener");
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
