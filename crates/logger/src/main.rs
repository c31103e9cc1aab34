//! arexx-logger
//!
//! Reads temperature and humidity readings from Arexx USB receivers and
//! forwards them to log, file and TCP outputs.

use anyhow::{Context, Result};
use clap::Parser;
use common::{ListenerSet, SensorRegistry, setup_logging};
use logger::config::LoggerConfig;
use logger::listeners::{ListenerContext, ListenerRegistry};
use logger::service;
use logger::usb::{DeviceManager, Poller, RusbBackend, Transport, UsbBackend, spawn_poll_worker};
use tokio::runtime::Handle;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "arexx-logger")]
#[command(
    author,
    version,
    about = "Arexx logger - collect sensor readings from TL-300/TL-500/BS-510 receivers"
)]
#[command(long_about = "
Polls Arexx TL-300, TL-500 and BS-510 USB receivers for wireless sensor
readings and forwards them to the configured outputs.

EXAMPLES:
    # Run with default config
    arexx-logger

    # Run with custom config
    arexx-logger --config ~/arexx.toml

    # List attached receivers without polling
    arexx-logger --list-devices

    # Run with debug logging
    arexx-logger --log-level debug

CONFIGURATION:
    The logger looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/arexx-logger/logger.toml
    3. /etc/arexx-logger/logger.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List attached receivers and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = LoggerConfig::default();
        let path = LoggerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        LoggerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        LoggerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logger.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("arexx-logger v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let backend = RusbBackend::new().context("Failed to initialize USB")?;

    if args.list_devices {
        return list_devices(&backend);
    }

    let mut registry = SensorRegistry::new();
    let defined = config.apply_sensors(&mut registry);
    info!("{} sensors defined from configuration", defined);

    let listeners = ListenerSet::new();
    let context = ListenerContext::with_runtime(Handle::current());
    let outputs = config.build_listeners(&ListenerRegistry::with_builtin(), &context, &listeners);
    if outputs == 0 {
        warn!("No outputs configured, nothing to do");
        return Ok(());
    }

    let manager = DeviceManager::new(backend, config.logger.max_device_errors);
    let poller = Poller::new(manager, registry, listeners.clone(), config.poll_settings());
    let worker = spawn_poll_worker(poller).context("Failed to spawn poll worker")?;

    if service::is_systemd() {
        info!("Running under systemd");
    }
    if let Err(e) = service::notify_ready() {
        error!("Failed to notify systemd: {:#}", e);
    }
    if let Err(e) = service::notify_status(&format!("Polling with {} outputs", outputs)) {
        error!("Failed to send status to systemd: {:#}", e);
    }
    info!("Press Ctrl+C to shutdown");

    let mut join = tokio::task::spawn_blocking(move || worker.join());

    let result = tokio::select! {
        signal_result = signal::ctrl_c() => {
            match signal_result {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
            if let Err(e) = service::notify_stopping() {
                error!("Failed to notify systemd: {:#}", e);
            }
            // the worker exits after its current cycle
            listeners.clear();
            join.await
        }
        result = &mut join => result,
    };

    match result.context("Failed to join poll worker")? {
        Ok(cycles) => info!("Poll worker stopped after {} cycles", cycles),
        Err(e) => error!("Poll worker panicked: {:?}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

/// List attached receivers and exit
fn list_devices(backend: &RusbBackend) -> Result<()> {
    let devices = backend.discover().context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No TL-300/TL-500/BS-510 device found.");
    } else {
        println!("Found {} receiver(s):\n", devices.len());
        for device in devices {
            println!(
                "  {:04x}:{:04x} at {}",
                protocol::VENDOR_ID,
                protocol::PRODUCT_ID,
                device.location()
            );
        }
    }

    Ok(())
}
