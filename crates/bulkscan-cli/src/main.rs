//! Composition root for the two bulkscan binaries-in-one: `controller` publishes and monitors a
//! bulk scan, `worker` drains the job queue and runs probes. Wiring only — the algorithms live
//! in `bulkscan-controller`, `bulkscan-worker` and `bulkscan-monitor`.

mod tcp_connect;

use anyhow::{Context, Result};
use bulkscan_bus::OrchestrationBus;
use bulkscan_core::{BulkScan, Config, Denylist, ProgressMonitor, ScanConfig, SystemResolver};
use bulkscan_monitor::ProgressMonitorService;
use bulkscan_store::SqliteResultStore;
use bulkscan_worker::{RouterConfig, ScannerFactory, WorkerManager, WorkerRouter};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "bulkscan", about = "Distributed dispatch and execution pipeline for bulk TLS probing scans")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "bulkscan.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a bulk scan's targets onto the job queue and monitor its progress.
    Controller {
        /// File of newline-delimited target specs, or "-" to read stdin.
        #[arg(short, long, default_value = "-")]
        targets: String,

        /// Human-readable name for this bulk scan.
        #[arg(short, long, default_value = "bulkscan")]
        name: String,

        /// `scan_config.kind`, selecting which registered `ScannerFactory` handles this scan.
        #[arg(long, default_value = tcp_connect::KIND)]
        kind: String,
    },
    /// Drain the job queue and run probes until interrupted.
    Worker,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = Config::load_from_file(&args.config)
        .with_context(|| format!("loading config from {:?}", args.config))?;

    match args.command {
        Command::Controller { targets, name, kind } => run_controller(config, targets, name, kind).await,
        Command::Worker => run_worker(config).await,
    }
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .init();
}

async fn run_controller(config: Config, targets: String, name: String, kind: String) -> Result<()> {
    let bus = Arc::new(
        OrchestrationBus::connect(&config.bus.amqp_uri, config.bus.job_queue_name.clone())
            .await
            .context("connecting to orchestration bus")?,
    );
    let job_producer = Arc::new(bus.job_producer().await.context("declaring job queue")?);
    let store = Arc::new(
        SqliteResultStore::new(&config.store_path)
            .await
            .context("opening result store")?,
    );
    let monitor: Arc<dyn ProgressMonitor> = Arc::new(ProgressMonitorService::new(Arc::clone(&bus), store.clone()));

    let denylist = match &config.controller.denylist_path {
        Some(path) => Arc::new(Denylist::load_from_file(path).with_context(|| format!("loading denylist {path:?}"))?),
        None => Arc::new(Denylist::empty()),
    };

    let resolver = SystemResolver::from_system_conf().context("initializing system DNS resolver")?;
    let publisher = bulkscan_controller::Publisher::new(
        resolver,
        config.controller.default_port,
        config.controller.parse_concurrency,
        job_producer,
        store,
        Some(monitor),
    );

    let target_list = read_targets(&targets)?;
    let scan_config = ScanConfig { kind, ..ScanConfig::default() };
    let bulk_scan = BulkScan::new_draft(
        name,
        scan_config,
        config.controller.monitored,
        config.controller.notify_url.clone(),
    );

    let report = publisher.publish(bulk_scan, target_list, denylist).await.context("publishing bulk scan")?;
    info!(
        bulk_scan_id = report.bulk_scan_id,
        targets_given = report.targets_given,
        published = report.published,
        denylisted = report.denylisted,
        resolution_errors = report.resolution_errors,
        "bulk scan published"
    );

    bus.close().await.context("closing bus connection")?;
    Ok(())
}

fn read_targets(spec: &str) -> Result<Vec<String>> {
    let contents = if spec == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading targets from stdin")?;
        buf
    } else {
        std::fs::read_to_string(spec).with_context(|| format!("reading targets file {spec:?}"))?
    };
    Ok(contents.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
}

async fn run_worker(config: Config) -> Result<()> {
    let bus = Arc::new(
        OrchestrationBus::connect(&config.bus.amqp_uri, config.bus.job_queue_name.clone())
            .await
            .context("connecting to orchestration bus")?,
    );
    let consumer_tag = format!("worker-{}", std::process::id());
    let consumer = bus
        .job_consumer(config.bus.prefetch, &consumer_tag)
        .await
        .context("opening job consumer")?;

    let store = Arc::new(
        SqliteResultStore::new(&config.store_path)
            .await
            .context("opening result store")?,
    );

    let mut registry: HashMap<String, Arc<dyn ScannerFactory>> = HashMap::new();
    registry.insert(tcp_connect::KIND.to_string(), Arc::new(tcp_connect::TcpConnectScannerFactory));

    let manager = Arc::new(WorkerManager::new(
        registry,
        config.worker.parallel_scan_threads,
        Duration::from_secs(config.worker.worker_idle_timeout_secs),
    ));
    let _eviction_task = Arc::clone(&manager).spawn_eviction_task(Duration::from_secs(60));

    let router = WorkerRouter::new(
        store,
        bus,
        manager,
        RouterConfig {
            scan_timeout: Duration::from_millis(config.worker.scan_timeout_ms),
            cancel_grace: Duration::from_millis(config.worker.cancel_grace_ms),
            default_excluded_probes: config.worker.default_excluded_probes.clone(),
            merge_policy: config.worker.merge_policy,
            parallel_result_handlers: config.worker.parallel_connection_threads,
        },
    );

    info!("worker ready, draining job queue");
    router.run(consumer).await;
    Ok(())
}
