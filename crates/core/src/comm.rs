//! Device communication layer: one HID++ channel per physical device.
//!
//! A receiver exposes its short and long collections as separate OS handles,
//! and every paired device behind it shares them. [`HidppChannel`] writes
//! requests to the short handle and runs a reader thread per handle that routes
//! each incoming report either to the request currently waiting for it or to
//! the notification queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hidpp::{reply_matches, VERY_LONG_REPORT_LEN};
use crate::transport::{HidTransport, DEFAULT_TIMEOUT};

/// How long a reader thread idles between polls when nothing arrived.
///
/// Reads never block: a handle may serialize reads and writes, and a blocked
/// read would hold the writer back.
const READ_IDLE: Duration = Duration::from_millis(2);

/// Raw OS handle to one HID interface.
pub trait HidHandle: Send + Sync {
    /// Write one report.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Read one report into `buf`, returning 0 when nothing arrived in time.
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;
}

/// [`HidHandle`] over an opened hidapi device.
pub struct HidapiHandle {
    device: Mutex<hidapi::HidDevice>,
    path: String,
}

impl HidapiHandle {
    pub fn new(device: hidapi::HidDevice, path: impl Into<String>) -> Self {
        Self {
            device: Mutex::new(device),
            path: path.into(),
        }
    }

    fn device(&self) -> Result<std::sync::MutexGuard<'_, hidapi::HidDevice>> {
        self.device
            .lock()
            .map_err(|_| Error::Hid(format!("{}: handle lock poisoned", self.path)))
    }
}

impl HidHandle for HidapiHandle {
    fn write(&self, data: &[u8]) -> Result<usize> {
        self.device()?
            .write(data)
            .map_err(|e| Error::Hid(format!("write {}: {e}", self.path)))
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        self.device()?
            .read_timeout(buf, timeout_ms)
            .map_err(|e| Error::Hid(format!("read_timeout {}: {e}", self.path)))
    }
}

struct Pending {
    request: Vec<u8>,
    reply_tx: mpsc::Sender<Vec<u8>>,
}

/// Request/reply multiplexer over a device's HID handles.
pub struct HidppChannel {
    writer: Arc<dyn HidHandle>,
    transaction: Mutex<()>,
    pending: Mutex<Option<Pending>>,
    notifications: UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
}

impl HidppChannel {
    /// Create a channel writing to `writer`. Unsolicited reports arrive on the returned receiver.
    pub fn new(writer: Arc<dyn HidHandle>) -> (Arc<Self>, UnboundedReceiver<Vec<u8>>) {
        let (notifications, notification_rx) = unbounded_channel();
        let channel = Arc::new(Self {
            writer,
            transaction: Mutex::new(()),
            pending: Mutex::new(None),
            notifications,
            closed: AtomicBool::new(false),
        });
        (channel, notification_rx)
    }

    /// Start a reader thread pumping `handle` into this channel until it closes.
    pub fn spawn_reader(
        self: &Arc<Self>,
        handle: Arc<dyn HidHandle>,
        name: &str,
    ) -> Result<thread::JoinHandle<()>> {
        let channel = Arc::clone(self);
        thread::Builder::new()
            .name(format!("hidpp-reader-{name}"))
            .spawn(move || channel.pump(handle.as_ref()))
            .map_err(Error::Io)
    }

    fn pump(&self, handle: &dyn HidHandle) {
        let mut buf = [0u8; VERY_LONG_REPORT_LEN];
        while !self.is_closed() {
            match handle.read_timeout(&mut buf, 0) {
                Ok(0) => thread::sleep(READ_IDLE),
                Ok(n) => self.dispatch(&buf[..n]),
                Err(e) => {
                    if !self.is_closed() {
                        warn!(error = %e, "HID read failed, closing channel");
                        self.close();
                    }
                    break;
                }
            }
        }
        trace!("Reader thread exiting");
    }

    /// Route one incoming report.
    pub fn dispatch(&self, report: &[u8]) {
        trace!(report_hex = format_args!("{:02X?}", report), "HID++ report");
        if let Ok(mut pending) = self.pending.lock() {
            let answers = pending
                .as_ref()
                .is_some_and(|p| reply_matches(&p.request, report));
            if answers {
                if let Some(p) = pending.take() {
                    if p.reply_tx.send(report.to_vec()).is_err() {
                        trace!("Reply dropped, requester gave up");
                    }
                }
                return;
            }
        }
        if self.notifications.send(report.to_vec()).is_err() {
            trace!("Notification dropped, no listener");
        }
    }

    /// Close the channel: fail the in-flight request and stop the readers.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing HID++ channel");
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn clear_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
    }
}

impl HidTransport for HidppChannel {
    fn send_report(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.send_report_timeout(data, DEFAULT_TIMEOUT)
    }

    fn send_report_timeout(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let _transaction = self
            .transaction
            .lock()
            .map_err(|_| Error::Hid("transaction lock poisoned".into()))?;
        if self.is_closed() {
            return Err(Error::Disconnected("channel closed".into()));
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        *self
            .pending
            .lock()
            .map_err(|_| Error::Hid("pending lock poisoned".into()))? = Some(Pending {
            request: data.to_vec(),
            reply_tx,
        });

        if let Err(e) = self.writer.write(data) {
            self.clear_pending();
            return Err(e);
        }

        let result = match reply_rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "no reply within {}ms",
                timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Disconnected("channel closed during request".into()))
            }
        };
        self.clear_pending();
        result
    }
}
