//! Lowcar device handler
//!
//! Polls USB for lowcar boards and relays their parameters to the shared
//! parameter store. Each board gets its own supervisor, sender and receiver
//! thread; the Tokio runtime only handles signals and lifecycle events.

use anyhow::{Context, Result};
use clap::Parser;
use common::{
    HandlerCommand, MemoryStore, RelayEvent, create_handler_bridge, setup_logging,
};
use dev_handler::config::HandlerConfig;
use dev_handler::relay::RelayServices;
use dev_handler::usb::{DiscoveryPoller, RusbSource, list_devices, spawn_discovery};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "lowcar-dev-handler")]
#[command(author, version, about = "Lowcar device handler - relay USB devices to the parameter store")]
#[command(long_about = "
Discovers lowcar boards on USB, handshakes with each one and relays its
parameters to and from the parameter store.

EXAMPLES:
    # Run with default config
    lowcar-dev-handler

    # Run with custom config
    lowcar-dev-handler --config /path/to/config.toml

    # List the USB devices discovery would consider
    lowcar-dev-handler --list-devices

    # Run with debug logging
    lowcar-dev-handler --log-level debug

CONFIGURATION:
    The handler looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/lowcar/dev-handler.toml
    3. /etc/lowcar/dev-handler.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
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
        let config = HandlerConfig::default();
        let path = HandlerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let (config, fallback) = match args.config {
        Some(ref path) => (
            HandlerConfig::load(Some(path.clone())).context("Failed to load configuration")?,
            None,
        ),
        None => HandlerConfig::load_or_default(&HandlerConfig::search_paths()),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.handler.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("Lowcar device handler v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);
    if let Some(reason) = fallback {
        warn!("{:#}, using defaults", reason);
    }

    if args.list_devices {
        return list_devices_mode(&config);
    }

    run(config).await
}

/// Print the devices discovery would relay and exit
fn list_devices_mode(config: &HandlerConfig) -> Result<()> {
    let devices = list_devices(&config.usb).context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for usb in devices {
            println!(
                "  Bus {:03} Device {:03}  {:04x}:{:04x}",
                usb.bus_number, usb.device_address, usb.vendor_id, usb.product_id
            );
        }
    }

    Ok(())
}

async fn run(config: HandlerConfig) -> Result<()> {
    let catalog = config.load_catalog()?;
    info!("Device catalog: {} device types", catalog.len());

    let (bridge, link) = create_handler_bridge();
    let services = RelayServices {
        catalog: Arc::new(catalog),
        store: Arc::new(MemoryStore::new()),
        events: link.events(),
        timing: config.timing.relay_timing(),
        checksum: config.protocol.checksum,
    };

    let source = RusbSource::new(&config.usb).context("Failed to initialize libusb")?;
    let poller = DiscoveryPoller::new(source, link, services, config.usb.poll_interval());
    let discovery = spawn_discovery(poller).context("Failed to spawn discovery thread")?;

    info!("Press Ctrl+C to shutdown");

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            event = bridge.recv_event() => match event {
                Ok(event) => log_event(&event),
                Err(e) => {
                    warn!("Discovery stopped unexpectedly: {}", e);
                    break;
                }
            },
        }
    }

    if let Err(e) = bridge.send_command(HandlerCommand::Shutdown).await {
        warn!("Failed to send shutdown command: {}", e);
    }

    // Drain events until discovery has joined every relay
    let mut joined = tokio::task::spawn_blocking(move || discovery.join());
    let mut events_open = true;
    let result = loop {
        tokio::select! {
            result = &mut joined => break result,
            event = bridge.recv_event(), if events_open => match event {
                Ok(event) => log_event(&event),
                Err(_) => events_open = false,
            },
        }
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(_)) => error!("Discovery thread panicked"),
        Err(e) => error!("Failed to join discovery thread: {}", e),
    }

    info!("Device handler shutdown complete");
    Ok(())
}

fn log_event(event: &RelayEvent) {
    match event {
        RelayEvent::DeviceAttached { usb } => info!("Attached: {}", usb),
        RelayEvent::DeviceDetached { usb } => info!("Detached: {}", usb),
        RelayEvent::RelayActive { usb, device, slot } => {
            info!("Relaying {} ({}) in slot {}", usb, device, slot)
        }
        RelayEvent::RelayStopped {
            usb,
            device,
            reason,
        } => match device {
            Some(device) => info!("Relay {} ({}) stopped: {}", usb, device, reason),
            None => info!("Relay {} stopped: {}", usb, reason),
        },
    }
}
