//! usb-monitor
//!
//! Watches the host for USB devices, asks for access to the ones selected by
//! the configured filters and keeps a single open handle per device.

use anyhow::{Context, Result};
use clap::Parser;
use common::{UsbDevice, setup_logging};
use monitor::config::{self, MonitorConfig};
use monitor::usb::{
    ChannelListener, DeviceFilter, Monitor, MonitorEvent, PermissionRequest, RusbHost,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-monitor")]
#[command(author, version, about = "USB device monitor - track attach, permission and connection state")]
#[command(long_about = "
Watches USB devices attached to this host. Devices selected by the configured
filters get a permission request on attach and are opened once granted; every
attach, detach, connect, disconnect and cancel is logged.

EXAMPLES:
    # Watch with default config
    usb-monitor

    # Only watch Brother devices, skipping root hubs
    usb-monitor --filter '!0x1d6b:*' --filter '0x04f9:*'

    # List devices with their identity keys as JSON
    usb-monitor --list-devices --json

    # Run with debug logging
    usb-monitor --log-level debug

CONFIGURATION:
    The monitor looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-monitor/monitor.toml
    3. /etc/usb-monitor/monitor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the device list as JSON
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Device filter (VID:PID, '*' wildcard, leading '!' excludes); repeatable
    #[arg(short, long, value_name = "FILTER")]
    filter: Vec<DeviceFilter>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = MonitorConfig::default();
        let path = match &args.config {
            Some(path) => config::expand_path(path),
            None => MonitorConfig::default_path(),
        };
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        MonitorConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.monitor.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let mut settings = config.to_settings().context("Invalid configuration")?;
    if !args.filter.is_empty() {
        settings.filters = args.filter.clone();
    }

    let host = Arc::new(RusbHost::new().context("Failed to initialize libusb")?);
    let (listener, events) = ChannelListener::new();
    let monitor = Arc::new(
        Monitor::new(host, Arc::new(listener), settings).context("Failed to create monitor")?,
    );

    let result = if args.list_devices {
        list_devices_mode(&monitor, args.json)
    } else {
        watch_mode(&monitor, events, config.usb.auto_request_permission).await
    };

    info!("Shutting down monitor...");
    if let Err(e) = monitor.destroy() {
        error!("Error destroying monitor: {:#}", e);
    }

    result
}

#[derive(Serialize)]
struct DeviceRow<'a> {
    key: String,
    hash: i32,
    permission: bool,
    #[serde(flatten)]
    device: &'a UsbDevice,
}

/// List USB devices and exit
fn list_devices_mode(monitor: &Monitor, json: bool) -> Result<()> {
    let devices = monitor.device_list().context("Failed to enumerate devices")?;

    let mut rows = Vec::with_capacity(devices.len());
    for device in &devices {
        let key = monitor.device_key(device);
        rows.push(DeviceRow {
            hash: key.hash32(),
            key: key.to_string(),
            permission: monitor.has_permission(device)?,
            device,
        });
    }

    if json {
        let out = serde_json::to_string_pretty(&rows).context("Failed to encode device list")?;
        println!("{}", out);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", rows.len());
    for row in rows {
        let device = row.device;
        println!(
            "  {} {:04x}:{:04x} - {} {}",
            device.name,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer_name
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product_name.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      Class {:#04x} Permission: {}",
            device.class,
            if row.permission { "granted" } else { "none" }
        );
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
        println!("      Key: {} (hash {})", row.key, row.hash);
        println!();
    }

    Ok(())
}

/// Register the monitor and log events until Ctrl+C
async fn watch_mode(
    monitor: &Arc<Monitor>,
    events: async_channel::Receiver<MonitorEvent>,
    auto_request: bool,
) -> Result<()> {
    monitor.register().context("Failed to register monitor")?;
    monitor.dump_devices()?;

    if auto_request {
        for device in monitor.device_list()? {
            request(monitor, &device);
        }
    }

    info!("Press Ctrl+C to shutdown");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else {
                    warn!("Listener channel closed");
                    break;
                };
                log_event(&event);
                if auto_request && let MonitorEvent::Attached(device) = &event {
                    request(monitor, device);
                }
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
        }
    }

    monitor.unregister()?;
    Ok(())
}

fn request(monitor: &Monitor, device: &UsbDevice) {
    match monitor.request_permission(device) {
        Ok(PermissionRequest::Pending) => info!("Waiting for permission on {}", device.name),
        Ok(result) => info!("Permission for {}: {:?}", device.name, result),
        Err(e) => warn!("Permission request for {} failed: {}", device.name, e),
    }
}

fn log_event(event: &MonitorEvent) {
    let device = event.device();
    match event {
        MonitorEvent::Connected { block, created, .. } => {
            let (manufacturer, product) = block
                .info()
                .map(|info| (info.manufacturer.clone(), info.product.clone()))
                .unwrap_or_default();
            info!(
                "connect {} {:04x}:{:04x} {} {} (new handle: {})",
                device.name,
                device.vendor_id,
                device.product_id,
                manufacturer.as_deref().unwrap_or("?"),
                product.as_deref().unwrap_or("?"),
                created
            );
        }
        MonitorEvent::Disconnected { key, .. } => {
            info!("disconnect {} key={}", device.name, key);
        }
        _ => info!(
            "{} {} {:04x}:{:04x}",
            event.kind(),
            device.name,
            device.vendor_id,
            device.product_id
        ),
    }
}
