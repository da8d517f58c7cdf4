//! Event distribution inside a process and between processes.
//!
//! [`EventBus`] fans messages out to in-process consumers. Across processes the
//! HID daemon connects a [`BusPublisher`] to the service's [`BusServer`] and
//! writes one JSON envelope per line; the server hands each message to the
//! subscribers registered for its type, in arrival order.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::ipc::{IpcMessage, MessageKind};

/// In-process publish/subscribe for device messages.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IpcMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, message: IpcMessage) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IpcMessage> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Republish messages from a distributed subscription onto `bus`, unmodified.
pub async fn bridge_to_local(
    mut incoming: UnboundedReceiver<IpcMessage>,
    bus: EventBus,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = incoming.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if bus.publish(message) == 0 {
            trace!("No local subscribers");
        }
    }
}

type Subscribers = Arc<Mutex<Vec<(Vec<MessageKind>, UnboundedSender<IpcMessage>)>>>;

fn dispatch(subscribers: &Subscribers, message: IpcMessage) {
    let kind = message.kind();
    let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|(kinds, sender)| {
        !kinds.contains(&kind) || sender.send(message.clone()).is_ok()
    });
}

#[cfg(unix)]
pub use self::unix::{relay_events, BusPublisher, BusServer};

#[cfg(unix)]
mod unix {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::unix::OwnedWriteHalf;
    use tokio::net::{UnixListener, UnixStream};
    use tokio::task::JoinSet;

    use super::*;
    use crate::error::{Error, Result};

    /// Listening end of the distributed channel, hosted by the service.
    pub struct BusServer {
        listener: UnixListener,
        path: PathBuf,
        subscribers: Subscribers,
        token: CancellationToken,
    }

    impl BusServer {
        /// Bind `path`, replacing a stale socket left by a previous run.
        pub fn bind(path: &Path, token: CancellationToken) -> Result<Self> {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)
                .map_err(|e| Error::Ipc(format!("bind {}: {e}", path.display())))?;
            debug!(path = %path.display(), "Event bus listening");
            Ok(Self {
                listener,
                path: path.to_path_buf(),
                subscribers: Arc::new(Mutex::new(Vec::new())),
                token,
            })
        }

        /// Receive every message whose type is in `kinds`, in arrival order.
        pub fn subscribe(&self, kinds: &[MessageKind]) -> UnboundedReceiver<IpcMessage> {
            let (tx, rx) = unbounded_channel();
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((kinds.to_vec(), tx));
            rx
        }

        /// Accept publishers until cancelled. Closing drops every connection.
        pub async fn run(self) {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            debug!("Publisher connected");
                            connections.spawn(serve_connection(
                                stream,
                                Arc::clone(&self.subscribers),
                                self.token.clone(),
                            ));
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                }
            }

            while connections.join_next().await.is_some() {}
            if let Err(e) = std::fs::remove_file(&self.path) {
                trace!(error = %e, "Socket already removed");
            }
            debug!("Event bus closed");
        }
    }

    async fn serve_connection(stream: UnixStream, subscribers: Subscribers, token: CancellationToken) {
        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<IpcMessage>(&line) {
                    Ok(message) => {
                        trace!(kind = ?message.kind(), id = message.device_id(), "Bus message");
                        dispatch(&subscribers, message);
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed bus message"),
                },
                Ok(None) => {
                    debug!("Publisher disconnected");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Bus connection failed");
                    break;
                }
            }
        }
    }

    /// Sending end of the distributed channel, used by the HID daemon.
    pub struct BusPublisher {
        writer: tokio::sync::Mutex<OwnedWriteHalf>,
        closed: CancellationToken,
    }

    impl BusPublisher {
        /// Connect to `path`, retrying while the server comes up.
        pub async fn connect(path: &Path, attempts: u32, retry_delay: Duration) -> Result<Self> {
            let mut last_error = None;
            for attempt in 1..=attempts.max(1) {
                match UnixStream::connect(path).await {
                    Ok(stream) => return Ok(Self::from_stream(stream)),
                    Err(e) => {
                        trace!(attempt, error = %e, "Event bus not reachable yet");
                        last_error = Some(e);
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
            Err(Error::Ipc(format!(
                "connect {}: {}",
                path.display(),
                last_error.map_or_else(|| "no attempts".to_string(), |e| e.to_string())
            )))
        }

        fn from_stream(stream: UnixStream) -> Self {
            let (mut reader, writer) = stream.into_split();
            let closed = CancellationToken::new();
            let watch = closed.clone();
            // The server never writes; a read returning means it went away.
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                debug!("Event bus connection closed by service");
                watch.cancel();
            });
            Self {
                writer: tokio::sync::Mutex::new(writer),
                closed,
            }
        }

        pub async fn publish(&self, message: &IpcMessage) -> Result<()> {
            let mut line = serde_json::to_vec(message)?;
            line.push(b'\n');
            let mut writer = self.writer.lock().await;
            writer
                .write_all(&line)
                .await
                .map_err(|e| Error::Ipc(format!("publish: {e}")))
        }

        /// Cancelled once the service side closes the connection.
        pub fn closed(&self) -> CancellationToken {
            self.closed.clone()
        }
    }

    /// Forward device events to the bus until cancelled or the source closes.
    pub async fn relay_events(
        mut events: UnboundedReceiver<IpcMessage>,
        publisher: Arc<BusPublisher>,
        token: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = events.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Err(e) = publisher.publish(&message).await {
                warn!(id = message.device_id(), error = %e, "Event not delivered");
            }
        }
    }
}
