use clap::{Args, Parser};
use metrics_exporter_statsd::StatsdBuilder;
use reporting::{
    AllowAll, DeliveryAgent, DeliveryContext, EndpointManager, HttpUploader, MemoryStore,
    OriginAllowList, PermissionOracle, UploadError,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;
mod spool;

use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use spool::SpoolError;

const METRICS_PREFIX: &str = "reportd";
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(version, about = "Delivers queued reports to their configured endpoints")]
enum CliCommand {
    /// Deliver every report in a spool file, then exit
    Deliver(DeliverArgs),
    /// Load and validate a configuration file
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Args)]
struct DeliverArgs {
    #[arg(long)]
    config: PathBuf,
    /// File with one JSON report per line
    #[arg(long)]
    reports: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum ReportdError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error("could not create uploader: {0}")]
    Uploader(#[from] UploadError),
    #[error("could not set up metrics: {0}")]
    Metrics(#[from] metrics_exporter_statsd::StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
}

#[tokio::main]
async fn main() -> ExitCode {
    let result = match CliCommand::parse() {
        CliCommand::Deliver(args) => deliver(args).await,
        CliCommand::CheckConfig(args) => check_config(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(args: ConfigArgs) -> Result<(), ReportdError> {
    let config = Config::from_file(&args.config)?;
    println!(
        "{}: ok ({} endpoint groups, delivery every {}s)",
        args.config.display(),
        config.endpoint_groups.len(),
        config.delivery.delivery_interval_secs
    );
    Ok(())
}

async fn deliver(args: DeliverArgs) -> Result<(), ReportdError> {
    let config = Config::from_file(&args.config)?;
    let _sentry = init_logging(config.logging.as_ref());
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }

    let policy = config.delivery;
    let store = Arc::new(MemoryStore::new(&policy));
    for group in config.endpoint_groups {
        store.set_endpoint_group(group);
    }

    let mut queued = 0;
    for report in spool::read_reports(&args.reports)? {
        match store.queue(report) {
            Ok(_) => queued += 1,
            Err(e) => tracing::warn!("Skipping report: {e}"),
        }
    }
    tracing::info!(reports = queued, "Queued reports from spool");

    let permissions: Arc<dyn PermissionOracle> = match config.allowed_origins {
        Some(origins) => Arc::new(OriginAllowList::new(origins)),
        None => Arc::new(AllowAll),
    };
    let context = DeliveryContext {
        store: store.clone(),
        selector: Arc::new(EndpointManager::new(
            store.clone(),
            policy.endpoint_backoff.clone(),
        )),
        permissions,
        uploader: Arc::new(HttpUploader::new(policy.upload_timeout())?),
    };
    let agent = DeliveryAgent::new(context, &policy);

    match agent.flush().await {
        Ok(summary) => tracing::info!(?summary, "Initial flush dispatched"),
        Err(e) => tracing::warn!("Initial flush failed: {e}"),
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(DRAIN_CHECK_INTERVAL);

    // The agent keeps retrying on its own schedule. Exit once everything has
    // been delivered or dropped and no upload is outstanding.
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Interrupted, stopping delivery");
                break;
            }
            _ = ticker.tick() => {
                if store.report_count() > 0 {
                    continue;
                }
                match agent.status().await {
                    Ok(status) if status.in_flight_uploads > 0 => continue,
                    _ => break,
                }
            }
        }
    }

    agent.shutdown().await;
    tracing::info!(undelivered = store.report_count(), "Delivery finished");
    Ok(())
}

fn init_logging(config: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    // The dsn was validated when the config was loaded.
    let guard = config
        .and_then(|logging| logging.sentry_dsn.parse::<sentry::types::Dsn>().ok())
        .map(|dsn| {
            sentry::init(sentry::ClientOptions {
                dsn: Some(dsn),
                release: sentry::release_name!(),
                ..Default::default()
            })
        });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), ReportdError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(METRICS_PREFIX))?;
    metrics::set_global_recorder(recorder).map_err(|_| ReportdError::RecorderInstalled)?;
    shared::metrics_defs::describe_metrics(reporting::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Sending metrics to statsd"
    );
    Ok(())
}
