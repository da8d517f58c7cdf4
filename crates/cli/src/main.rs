//! lgstray CLI: HID daemon, background service and snapshot tools.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lgstray_core::config::Settings;
use lgstray_core::device::{classify, enumerate_logitech, TransportKind};
use lgstray_core::snapshot::{self, PRESENTATION_REGION, SERVICE_REGION};

#[derive(Parser)]
#[command(
    name = "lgstray",
    version,
    about = "Battery telemetry for Logitech HID++ devices"
)]
struct Cli {
    /// Settings file (JSON). Missing settings use their defaults.
    #[arg(long, global = true, default_value = "lgstray.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List Logitech HID interfaces and their HID++ report size.
    ListDevices,
    /// Own the HID devices and publish battery events. Started by `service`.
    HidDaemon,
    /// Supervise the HID daemon and keep the shared-memory snapshots current.
    Service,
    /// Print the device list held in a shared-memory region.
    Snapshot {
        /// Region name.
        #[arg(long, default_value = PRESENTATION_REGION)]
        region: String,
    },
    /// Print the status document for one device.
    Status {
        /// Device id or device name.
        iden: String,
    },
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    match cli.command {
        Commands::ListDevices => list_devices()?,
        Commands::HidDaemon => daemon::run_hid_daemon(&settings)?,
        Commands::Service => daemon::run_service(&settings, &cli.config)?,
        Commands::Snapshot { region } => {
            let devices = snapshot::read_devices(&settings.shared_memory.region_dir(), &region);
            if devices.is_empty() {
                println!("No devices in {region}.");
            } else {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            }
        }
        Commands::Status { iden } => {
            let devices = snapshot::read_devices(&settings.shared_memory.region_dir(), SERVICE_REGION);
            match snapshot::find_record(&devices, &iden) {
                Some(record) => println!("{}", record.to_xml()),
                None => {
                    println!("{iden} not found.");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn list_devices() -> Result<()> {
    let api = hidapi::HidApi::new().map_err(|e| anyhow::anyhow!("hidapi init: {e}"))?;
    let interfaces = enumerate_logitech(&api);
    if interfaces.is_empty() {
        println!("No Logitech HID interfaces found.");
        println!("Ensure a receiver or device is connected and hidraw access is permitted.");
        return Ok(());
    }
    for interface in &interfaces {
        let kind = match classify(interface) {
            TransportKind::None => "-",
            TransportKind::Short => "short",
            TransportKind::Long => "long",
            TransportKind::VeryLong => "very-long",
        };
        println!(
            "PID 0x{:04X} usage 0x{:04X}:0x{:04X} {:<9} {} (container {})",
            interface.pid,
            interface.usage_page,
            interface.usage,
            kind,
            interface.path,
            interface.container()
        );
    }
    Ok(())
}

#[cfg(unix)]
mod daemon {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{Context, Result};
    use lgstray_core::bus::{bridge_to_local, relay_events, BusPublisher, BusServer, EventBus};
    use lgstray_core::config::{PollSchedule, Settings};
    use lgstray_core::hotplug::HotplugWatcher;
    use lgstray_core::ipc::MessageKind;
    use lgstray_core::logical::DeviceContext;
    use lgstray_core::snapshot::{
        run_periodic_writer, run_snapshot_service, DeviceStore, SharedRegion, SnapshotWriter,
        PRESENTATION_REGION, SERVICE_REGION,
    };
    use lgstray_core::supervisor::{ProcessLauncher, Supervisor};
    use lgstray_core::topology::{HidapiBackend, TopologyManager};
    use tokio::signal::unix::{signal, SignalKind};
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::task::JoinSet;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    const CONNECT_ATTEMPTS: u32 = 50;
    const CONNECT_RETRY: Duration = Duration::from_millis(100);
    const PRESENTATION_PERIOD: Duration = Duration::from_secs(1);

    #[tokio::main]
    pub async fn run_hid_daemon(settings: &Settings) -> Result<()> {
        let token = CancellationToken::new();
        let publisher = Arc::new(
            BusPublisher::connect(&settings.ipc.socket_path, CONNECT_ATTEMPTS, CONNECT_RETRY)
                .await
                .context("connecting to the service")?,
        );

        let (events, event_rx) = unbounded_channel();
        let context = DeviceContext {
            disabled_devices: Arc::new(settings.native.disabled_devices.clone()),
            schedule: PollSchedule::from_settings(&settings.native),
            events,
        };
        let api = Arc::new(Mutex::new(
            hidapi::HidApi::new().map_err(|e| anyhow::anyhow!("hidapi init: {e}"))?,
        ));
        let topology = Arc::new(TopologyManager::start(
            Arc::new(HidapiBackend::new(Arc::clone(&api))),
            context,
            token.clone(),
            tokio::runtime::Handle::current(),
        )?);
        let watcher = HotplugWatcher::spawn(
            api,
            topology.clone(),
            Duration::from_millis(settings.hotplug.scan_interval_ms),
            token.clone(),
        )?;
        let relay = tokio::spawn(relay_events(event_rx, Arc::clone(&publisher), token.clone()));
        info!("HID daemon started");

        let mut refresh = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
        let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let closed = publisher.closed();
        loop {
            tokio::select! {
                _ = refresh.recv() => topology.force_battery_updates().await,
                _ = closed.cancelled() => {
                    info!("Service closed the event bus");
                    break;
                }
                _ = terminate.recv() => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        token.cancel();
        topology.shutdown().await;
        if tokio::task::spawn_blocking(move || watcher.join()).await.is_err() {
            warn!("Hotplug watcher join failed");
        }
        if let Err(e) = relay.await {
            warn!(error = %e, "Event relay ended abnormally");
        }
        info!("HID daemon stopped");
        Ok(())
    }

    #[tokio::main]
    pub async fn run_service(settings: &Settings, config: &Path) -> Result<()> {
        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let server = BusServer::bind(&settings.ipc.socket_path, token.clone())
            .context("starting the event bus")?;
        let incoming = server.subscribe(&[MessageKind::Init, MessageKind::Update]);
        let bus = EventBus::new();

        if settings.shared_memory.enabled {
            let dir = settings.shared_memory.region_dir();
            let store = Arc::new(Mutex::new(DeviceStore::new()));
            let service_writer = Arc::new(SnapshotWriter::new(
                SharedRegion::create(&dir, SERVICE_REGION).context("creating service region")?,
            ));
            let presentation_writer = Arc::new(SnapshotWriter::new(
                SharedRegion::create(&dir, PRESENTATION_REGION)
                    .context("creating presentation region")?,
            ));
            tasks.spawn(run_snapshot_service(
                bus.subscribe(),
                Arc::clone(&store),
                service_writer,
                token.clone(),
            ));
            tasks.spawn(run_periodic_writer(
                store,
                presentation_writer,
                PRESENTATION_PERIOD,
                token.clone(),
            ));
        }
        tasks.spawn(bridge_to_local(incoming, bus, token.clone()));
        tasks.spawn(server.run());

        let launcher = ProcessLauncher::current_exe(vec![
            "--config".to_string(),
            config.display().to_string(),
            "hid-daemon".to_string(),
        ])?;
        let supervisor = Arc::new(Supervisor::new(Arc::new(launcher), token.clone()));
        let supervising = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.run().await }
        });
        info!("Service started");

        let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
        let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        loop {
            tokio::select! {
                _ = hangup.recv() => supervisor.rediscover_devices(),
                _ = terminate.recv() => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        token.cancel();
        if let Err(e) = supervising.await {
            warn!(error = %e, "Supervisor ended abnormally");
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Service task ended abnormally");
            }
        }
        info!("Service stopped");
        Ok(())
    }
}

#[cfg(not(unix))]
mod daemon {
    use std::path::Path;

    use anyhow::Result;
    use lgstray_core::config::Settings;

    pub fn run_hid_daemon(_settings: &Settings) -> Result<()> {
        anyhow::bail!("the HID daemon needs Unix domain sockets")
    }

    pub fn run_service(_settings: &Settings, _config: &Path) -> Result<()> {
        anyhow::bail!("the service needs Unix domain sockets")
    }
}
