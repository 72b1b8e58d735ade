//! # FPV Air Link
//!
//! Airborne link daemon: flight controller on one side, ground station on
//! the other.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use fpv_air_link::config::{Config, LoggingConfig, RuntimeSettings};
use fpv_air_link::link::{LinkSession, SessionOptions, TelemetrySources, UdpTransport};
use fpv_air_link::mavlink::{MavlinkEngine, MavlinkIds};
use fpv_air_link::media::Headless;
use fpv_air_link::msp::MspEngine;
use fpv_air_link::serial::port_trait::TokioSerialBackend;
use fpv_air_link::serial::{EngineSelector, SerialSettings, SerialSupervisor, WRITE_QUEUE_CAPACITY};
use fpv_air_link::telemetry::device::DeviceSampler;
use fpv_air_link::telemetry::{TelemetryQueue, DEVICE_QUEUE_CAPACITY, FC_QUEUE_CAPACITY};

/// Used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/air-link.toml";

/// Config file named by the first argument after the program name
fn config_path(mut args: impl Iterator<Item = String>) -> PathBuf {
    args.nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Install the subscriber; `RUST_LOG` overrides the default `info` filter
///
/// With a log directory configured, output goes to a daily rolling file
/// through a non-blocking writer. The returned guard flushes it on drop.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "air-link.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

/// Wire the serial side, telemetry producers and datagram link, then run
/// until Ctrl+C
///
/// Usage: `fpv-air-link [CONFIG]`
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(&config_path(std::env::args()))?;
    let _log_guard = init_logging(&config.logging);

    info!("FPV Air Link v{} starting...", env!("CARGO_PKG_VERSION"));

    let settings = Arc::new(RuntimeSettings::new(&config));
    let cancel = CancellationToken::new();

    // Flight controller engines share one outbound serial queue
    let (fc_queue, fc_telemetry) = TelemetryQueue::bounded(FC_QUEUE_CAPACITY);
    let (serial_tx, serial_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let msp = Arc::new(MspEngine::new(
        serial_tx.clone(),
        fc_queue.clone(),
        config.fc.telemetry_rate_hz,
        config.fc.rc_rate_hz,
    ));
    let mavlink = Arc::new(MavlinkEngine::new(
        serial_tx,
        fc_queue,
        MavlinkIds {
            target_sys_id: config.fc.mavlink_target_sys_id,
            gcs_sys_id: config.fc.mavlink_gcs_sys_id,
        },
        config.fc.telemetry_rate_hz,
        config.fc.rc_rate_hz,
    ));
    let engines = Arc::new(EngineSelector::new(msp, mavlink));
    let supervisor = SerialSupervisor::new(
        TokioSerialBackend,
        SerialSettings::from(&config.serial),
        engines.clone(),
        serial_rx,
    );

    // Host-side samples
    let headless = Arc::new(Headless);
    let (device_queue, device_telemetry) = TelemetryQueue::bounded(DEVICE_QUEUE_CAPACITY);
    let sampler = DeviceSampler::new(headless.clone(), headless.clone(), device_queue);

    let transport = UdpTransport::bind(config.link.bind_port)
        .await
        .context("Failed to open the link socket")?;
    let options = SessionOptions::resolve(&config.link).await?;
    let session = LinkSession::new(
        Arc::new(transport),
        options,
        engines,
        settings,
        headless.clone(),
        headless,
    );
    let sources = TelemetrySources {
        fc: fc_telemetry,
        device: device_telemetry,
    };

    let tasks = [
        tokio::spawn(supervisor.run(cancel.clone())),
        tokio::spawn({
            let cancel = cancel.clone();
            async move { sampler.run(cancel).await }
        }),
        tokio::spawn(session.run(sources, cancel.clone())),
    ];

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    info!("Shutdown complete");
    Ok(())
}
