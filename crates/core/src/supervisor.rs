//! Supervision of the privileged HID daemon process.
//!
//! The service keeps one daemon running. An exit after a healthy run (or one we
//! asked for) is followed by a relaunch; a run of quick failures trips the
//! breaker and supervision stops for good.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// A run at least this long counts as healthy.
pub const HEALTHY_RUNTIME: Duration = Duration::from_secs(20);
pub const RESTART_DELAY: Duration = Duration::from_secs(1);
/// Unhealthy cycles tolerated in a row.
pub const MAX_FAST_FAILS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Exited,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonExit {
    /// The supervisor terminated the process itself.
    pub killed: bool,
    pub code: Option<i32>,
}

impl DaemonExit {
    pub const KILLED: Self = Self {
        killed: true,
        code: None,
    };

    pub fn exited(code: Option<i32>) -> Self {
        Self {
            killed: false,
            code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Restart,
    GiveUp,
}

/// Counts consecutive unhealthy cycles.
#[derive(Debug, Default)]
pub struct FastFailBreaker {
    consecutive: u32,
}

impl FastFailBreaker {
    pub fn record(&mut self, exit: &DaemonExit, runtime: Duration) -> Verdict {
        if exit.killed || runtime >= HEALTHY_RUNTIME {
            self.consecutive = 0;
            return Verdict::Restart;
        }
        self.consecutive += 1;
        if self.consecutive > MAX_FAST_FAILS {
            Verdict::GiveUp
        } else {
            Verdict::Restart
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}

/// A running daemon.
#[async_trait]
pub trait DaemonProcess: Send {
    async fn wait(&mut self) -> Result<DaemonExit>;
    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn DaemonProcess>>;
}

/// Launches the daemon as a child process.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Run this executable again with `args`.
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

struct ChildProcess(tokio::process::Child);

#[async_trait]
impl DaemonProcess for ChildProcess {
    async fn wait(&mut self) -> Result<DaemonExit> {
        let status = self.0.wait().await?;
        Ok(DaemonExit::exited(status.code()))
    }

    async fn kill(&mut self) -> Result<()> {
        Ok(self.0.kill().await?)
    }
}

#[async_trait]
impl DaemonLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<Box<dyn DaemonProcess>> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{}: {e}", self.program.display()))))?;
        debug!(pid = ?child.id(), "HID daemon spawned");
        Ok(Box::new(ChildProcess(child)))
    }
}

pub struct Supervisor {
    launcher: Arc<dyn DaemonLauncher>,
    root: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    /// Supervise until `root` is cancelled or the breaker trips.
    pub fn new(launcher: Arc<dyn DaemonLauncher>, root: CancellationToken) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            launcher,
            root,
            current: Mutex::new(None),
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Restart the daemon so it enumerates devices from scratch.
    ///
    /// Only the current run is cancelled; the restart does not count as a failure.
    pub fn rediscover_devices(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(scope) => {
                info!("Rediscovering devices");
                scope.cancel();
            }
            None => debug!("No daemon running, nothing to rediscover"),
        }
    }

    pub async fn run(&self) {
        let mut breaker = FastFailBreaker::default();
        while !self.root.is_cancelled() {
            self.set_state(SupervisorState::Starting);
            let scope = self.root.child_token();
            *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(scope.clone());

            let started = Instant::now();
            let exit = match self.launcher.launch().await {
                Ok(mut process) => {
                    info!("HID daemon launched");
                    self.set_state(SupervisorState::Running);
                    supervise(process.as_mut(), &scope).await
                }
                Err(e) => {
                    error!(error = %e, "HID daemon failed to launch");
                    DaemonExit::exited(None)
                }
            };
            let runtime = started.elapsed();
            *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
            self.set_state(SupervisorState::Exited);
            info!(
                killed = exit.killed,
                code = ?exit.code,
                runtime_secs = runtime.as_secs_f64(),
                "HID daemon exited"
            );

            if self.root.is_cancelled() {
                break;
            }
            if breaker.record(&exit, runtime) == Verdict::GiveUp {
                error!(
                    failures = breaker.consecutive_failures(),
                    "HID daemon keeps failing, no longer restarting"
                );
                break;
            }

            self.set_state(SupervisorState::Restarting);
            tokio::select! {
                _ = self.root.cancelled() => break,
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
        self.set_state(SupervisorState::Stopped);
        debug!("Supervisor stopped");
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }
}

async fn supervise(process: &mut dyn DaemonProcess, scope: &CancellationToken) -> DaemonExit {
    let exited = tokio::select! {
        exit = process.wait() => Some(exit),
        _ = scope.cancelled() => None,
    };
    match exited {
        Some(Ok(exit)) => exit,
        Some(Err(e)) => {
            warn!(error = %e, "Waiting for HID daemon failed");
            DaemonExit::exited(None)
        }
        None => {
            if let Err(e) = process.kill().await {
                warn!(error = %e, "Failed to kill HID daemon");
            }
            DaemonExit::KILLED
        }
    }
}
