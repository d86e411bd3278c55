//! caremon-agent - streams wearable telemetry to the backend.
//!
//! Run with: `cargo run -p caremon-service --bin caremon-agent -- run`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use caremon_core::scan::{ScanOptions, scan_devices};
use caremon_core::{BleRadio, LinkEvent, PipelineHandle, TelemetryPipeline};
use caremon_service::{
    Config, DeliveryClient, HttpProbe, HttpTransport, LocationTracker, OfflineQueue, Probe,
    ReachabilityMonitor, Transport,
};
use caremon_store::Store;

/// Default log directive when neither `RUST_LOG` nor `--log-level` is given.
const DEFAULT_LOG_LEVEL: &str = "info";

/// caremon-agent - wearable telemetry agent.
#[derive(Parser, Debug)]
#[command(name = "caremon-agent")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Backend base URL (overrides config).
    #[arg(short, long, global = true)]
    backend: Option<String>,

    /// Log level for caremon crates (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan, connect and stream telemetry until interrupted (default).
    Run {
        /// Serial number or MAC to look for.
        #[arg(short, long)]
        fingerprint: Option<String>,

        /// Connect to this identifier directly, skipping the scan.
        #[arg(long)]
        device: Option<String>,
    },

    /// List nearby wearables.
    Scan {
        /// Only list devices advertising this serial number or MAC.
        #[arg(short, long)]
        fingerprint: Option<String>,

        /// Include devices that do not look like wearables.
        #[arg(long)]
        all: bool,
    },

    /// Inspect or maintain the offline request queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Show queued requests.
    List,
    /// Try to deliver every queued request now.
    Drain,
    /// Remove one request by id.
    Remove { id: String },
    /// Remove every queued request.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref())?;

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Ignoring unreadable default config: {}", e);
            Config::default()
        }),
    };

    if let Some(db_path) = args.database {
        config.queue.path = db_path;
    }
    if let Some(backend) = args.backend {
        config.backend.base_url = backend;
    }

    match args.command {
        Some(Command::Run { fingerprint, device }) => {
            if fingerprint.is_some() {
                config.device.fingerprint = fingerprint;
            }
            if device.is_some() {
                config.device.device_id = device;
            }
            config.validate()?;
            run_agent(config).await
        }
        None => {
            config.validate()?;
            run_agent(config).await
        }
        Some(Command::Scan { fingerprint, all }) => {
            config.validate()?;
            run_scan(&config, fingerprint.or(config.device.fingerprint.clone()), all).await
        }
        Some(Command::Queue { action }) => {
            config.validate()?;
            run_queue(&config, action).await
        }
    }
}

fn init_logging(level: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::from_default_env().add_directive(format!("caremon={}", level).parse()?),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("warn,caremon={}", DEFAULT_LOG_LEVEL))),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<Arc<Mutex<Store>>> {
    let store = Store::open(&config.queue.path)
        .with_context(|| format!("Failed to open database at {}", config.queue.path.display()))?;
    Ok(Arc::new(Mutex::new(store)))
}

fn http_transport(config: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    let transport = HttpTransport::new(config.backend.request_timeout(), config.backend.api_token.clone())
        .context("Failed to build HTTP client")?;
    Ok(Arc::new(transport))
}

async fn run_agent(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let store = open_store(&config)?;
    let transport = http_transport(&config)?;

    let probe = HttpProbe::new(
        format!(
            "{}/{}",
            config.backend.base_url.trim_end_matches('/'),
            config.reachability.probe_path.trim_start_matches('/')
        ),
        Duration::from_secs(config.reachability.probe_timeout_secs),
    )
    .context("Failed to build probe client")?;
    let online = probe.check().await;
    info!(online, "Initial reachability");

    let reachability = Arc::new(ReachabilityMonitor::new(online));
    let queue = Arc::new(OfflineQueue::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&reachability),
        config.queue.max_retries,
    ));
    if online {
        match queue.drain().await {
            Ok(report) if report.delivered + report.retried + report.abandoned + report.discarded > 0 => {
                info!(?report, "Start-up drain finished");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Start-up drain failed"),
        }
    }

    let mut background = vec![
        reachability.spawn_drain_trigger(Arc::clone(&queue), cancel.child_token()),
        reachability.spawn_probe(
            probe,
            Duration::from_secs(config.reachability.probe_interval_secs),
            cancel.child_token(),
        ),
    ];

    let location = LocationTracker::new(config.location.as_ref().map(|l| l.to_location()));
    let delivery = DeliveryClient::new(
        transport,
        Arc::clone(&queue),
        Arc::clone(&reachability),
        location.subscribe(),
        config.backend.ingest_url(),
    );

    let radio = Arc::new(BleRadio::new().await.context("Bluetooth is not available")?);
    let pipeline = TelemetryPipeline::spawn(radio, Arc::new(delivery), config.pipeline_options())?;
    background.push(spawn_event_logger(pipeline.subscribe(), cancel.child_token()));

    if config.device.auto_connect {
        if let Err(e) = connect_configured(&pipeline, &config).await {
            pipeline.shutdown().await;
            cancel.cancel();
            return Err(e);
        }
    } else {
        info!("auto_connect is off; waiting without a device");
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    let stats = pipeline.stats();
    pipeline.shutdown().await;
    cancel.cancel();
    for task in background {
        let _ = task.await;
    }

    info!(
        samples_decoded = stats.samples_decoded,
        batches_delivered = stats.batches_delivered,
        batches_queued = stats.batches_queued,
        "Agent stopped"
    );
    Ok(())
}

async fn connect_configured(pipeline: &PipelineHandle, config: &Config) -> anyhow::Result<()> {
    let device_id = match &config.device.device_id {
        Some(id) => id.clone(),
        None => {
            let fingerprint = config.device.fingerprint.as_deref();
            info!(fingerprint, "Scanning for wearable");
            let devices = pipeline.scan(fingerprint).await.context("Scan failed")?;
            match devices.into_iter().next() {
                Some(device) => {
                    info!(
                        device_id = %device.id,
                        name = device.name.as_deref().unwrap_or("Unknown"),
                        "Found wearable"
                    );
                    device.id
                }
                None => bail!("No matching wearable found"),
            }
        }
    };

    pipeline
        .connect(&device_id)
        .await
        .with_context(|| format!("Failed to connect to {}", device_id))
}

fn spawn_event_logger(mut events: broadcast::Receiver<LinkEvent>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(LinkEvent::StateChanged { device_id, state }) => {
                    info!(device_id = device_id.as_deref().unwrap_or("-"), %state, "Link state");
                }
                Ok(LinkEvent::ReconnectAbandoned { device_id, attempts }) => {
                    warn!(device_id = %device_id, attempts, "Gave up reconnecting; restart or rescan to resume");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn run_scan(config: &Config, fingerprint: Option<String>, all: bool) -> anyhow::Result<()> {
    let radio = BleRadio::new().await.context("Bluetooth is not available")?;
    let mut options = ScanOptions::new().window(Duration::from_secs(config.connection.scan_window_secs));
    if all {
        options = options.all_devices();
    }

    info!("Scanning for wearables ({}s)...", config.connection.scan_window_secs);
    let devices = scan_devices(&radio, &options, fingerprint.as_deref(), CancellationToken::new())
        .await
        .context("Failed to scan for devices")?;

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }
    println!("{:<40} {:<24} {:>6}  WEARABLE", "ID", "NAME", "RSSI");
    for device in &devices {
        println!(
            "{:<40} {:<24} {:>6}  {}",
            device.id,
            device.name.as_deref().unwrap_or("Unknown"),
            device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string()),
            if device.is_wearable { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn run_queue(config: &Config, action: QueueAction) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let transport = http_transport(config)?;
    // Maintenance commands assume the network is up; drain reports what failed.
    let reachability = Arc::new(ReachabilityMonitor::new(true));
    let queue = OfflineQueue::new(store, transport, reachability, config.queue.max_retries);

    match action {
        QueueAction::List => {
            let requests = queue.snapshot().await?;
            if requests.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }
            for request in &requests {
                println!(
                    "{}  {} {}  created={}  retries={}",
                    request.id(),
                    request.method(),
                    request.url(),
                    request
                        .created_at()
                        .format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_default(),
                    request.retry_count()
                );
            }
            println!("{} request(s) queued", requests.len());
        }
        QueueAction::Drain => {
            let report = queue.drain().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        QueueAction::Remove { id } => {
            if queue.remove(&id).await? {
                println!("Removed {}", id);
            } else {
                bail!("No queued request with id {}", id);
            }
        }
        QueueAction::Clear => {
            let removed = queue.clear().await?;
            println!("Removed {} request(s)", removed);
        }
    }
    Ok(())
}
