//! Built-in Rust plugins
//!
//! Registered ahead of the plugin directories, so a unit with the same name
//! on disk replaces them.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;

use crate::engine::monitor::{ NETWORK_PLUGIN, NetworkSample, sample_key, sample_network };
use crate::engine::result::Placeholders;
use crate::log_warn;
use crate::plugins::entrypoint::{ Entrypoint, InvocationContext };
use crate::plugins::registry::{ PluginDescriptor, PluginOrigin };

pub const SYSTEM_PLUGIN: &str = "system";

const DEFAULT_BAR_WIDTH: usize = 20;
const MAX_BAR_WIDTH: usize = 200;
pub const DEFAULT_NETWORK_INTERVAL_SECS: u64 = 2;

/// Descriptors for the requested built-ins, in the order given
pub fn builtin_plugins(names: &[String]) -> Vec<PluginDescriptor> {
    names
        .iter()
        .filter_map(|name| {
            let descriptor = match name.as_str() {
                SYSTEM_PLUGIN => system_descriptor(),
                NETWORK_PLUGIN => network_descriptor(),
                other => {
                    log_warn!("Unknown built-in plugin '{}'", other);
                    return None;
                }
            };
            Some(descriptor)
        })
        .collect()
}

fn system_descriptor() -> PluginDescriptor {
    PluginDescriptor::new(SYSTEM_PLUGIN, PluginOrigin::Builtin, Arc::new(SystemPlugin))
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_placeholders(&["cpu", "cpu_bar", "mem", "mem_bar", "load", "uptime"])
        .with_help(
            "CPU, memory, load and uptime.\n\
             {cpu}     - CPU usage, e.g. 12.5%\n\
             {cpu_bar} - CPU usage bar\n\
             {mem}     - Memory usage, e.g. 43.0%\n\
             {mem_bar} - Memory usage bar\n\
             {load}    - 1/5/15 minute load average\n\
             {uptime}  - Time since boot\n\
             Settings: bar_width (20)"
        )
}

fn network_descriptor() -> PluginDescriptor {
    PluginDescriptor::new(NETWORK_PLUGIN, PluginOrigin::Builtin, Arc::new(NetworkSpeedPlugin))
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_placeholders(&["net_speed", "download_speed", "upload_speed", "network_usage", "network_interface"])
        .with_help(
            "Current network throughput.\n\
             {net_speed}         - Download and upload speed\n\
             {download_speed}    - Download speed\n\
             {upload_speed}      - Upload speed\n\
             {network_usage}     - Traffic since sampling started\n\
             {network_interface} - Monitored interface\n\
             Settings: interval (2), units (mbps|kbps|B/s|auto), show_icons (true), interface (auto)"
        )
}

/// `width` cells, filled in proportion to `percent`
pub fn usage_bar(percent: f64, width: usize) -> String {
    let ratio = (percent / 100.0).clamp(0.0, 1.0);
    let filled = ((ratio * (width as f64)).round() as usize).min(width);
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

/// `3d 4h 12m`; days and hours are omitted while zero
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;

    match (days, hours) {
        (0, 0) => format!("{}m", minutes),
        (0, _) => format!("{}h {}m", hours, minutes),
        _ => format!("{}d {}h {}m", days, hours, minutes),
    }
}

struct SystemPlugin;

#[async_trait]
impl Entrypoint for SystemPlugin {
    async fn invoke(&self, ctx: InvocationContext) -> anyhow::Result<Placeholders> {
        let width = ctx
            .setting_u64("bar_width")
            .map(|w| w as usize)
            .unwrap_or(DEFAULT_BAR_WIDTH)
            .clamp(1, MAX_BAR_WIDTH);

        let mut sys = System::new();
        sys.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu = f64::from(sys.global_cpu_usage());
        let total = sys.total_memory();
        let mem = if total > 0 {
            ((sys.used_memory() as f64) / (total as f64)) * 100.0
        } else {
            0.0
        };
        let load = System::load_average();

        Ok(
            Placeholders::from([
                ("cpu".to_string(), format!("{:.1}%", cpu)),
                ("cpu_bar".to_string(), usage_bar(cpu, width)),
                ("mem".to_string(), format!("{:.1}%", mem)),
                ("mem_bar".to_string(), usage_bar(mem, width)),
                ("load".to_string(), format!("{:.2} {:.2} {:.2}", load.one, load.five, load.fifteen)),
                ("uptime".to_string(), format_uptime(System::uptime())),
            ])
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedUnits {
    Mbps,
    Kbps,
    BytesPerSec,
    Auto,
}

impl SpeedUnits {
    pub fn parse(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "mbps" => SpeedUnits::Mbps,
            "kbps" => SpeedUnits::Kbps,
            "b/s" => SpeedUnits::BytesPerSec,
            _ => SpeedUnits::Auto,
        }
    }
}

/// Render a byte rate; `icon` is prepended when given
pub fn format_speed(bytes_per_sec: f64, units: SpeedUnits, icon: Option<&str>) -> String {
    let (value, unit) = match units {
        SpeedUnits::Mbps => ((bytes_per_sec * 8.0) / 1_000_000.0, "Mbps"),
        SpeedUnits::Kbps => ((bytes_per_sec * 8.0) / 1_000.0, "Kbps"),
        SpeedUnits::BytesPerSec if bytes_per_sec >= 1_000_000.0 => (bytes_per_sec / 1_000_000.0, "MB/s"),
        SpeedUnits::BytesPerSec if bytes_per_sec >= 1_000.0 => (bytes_per_sec / 1_000.0, "KB/s"),
        SpeedUnits::BytesPerSec => (bytes_per_sec, "B/s"),
        SpeedUnits::Auto if bytes_per_sec > 1_000_000.0 => ((bytes_per_sec * 8.0) / 1_000_000.0, "Mbps"),
        SpeedUnits::Auto if bytes_per_sec > 1_000.0 => ((bytes_per_sec * 8.0) / 1_000.0, "Kbps"),
        SpeedUnits::Auto => (bytes_per_sec, "B/s"),
    };

    match icon {
        Some(icon) => format!("{} {:.1} {}", icon, value, unit),
        None => format!("{:.1} {}", value, unit),
    }
}

/// Session traffic, scaled by the download total
pub fn format_usage(received: u64, transmitted: u64) -> String {
    let (divisor, unit) = if received >= 1_000_000_000 {
        (1_000_000_000.0, "GB")
    } else if received >= 1_000_000 {
        (1_000_000.0, "MB")
    } else {
        (1_000.0, "KB")
    };
    format!(
        "↓{:.1}{} ↑{:.1}{}",
        (received as f64) / divisor,
        unit,
        (transmitted as f64) / divisor,
        unit
    )
}

struct NetworkSpeedPlugin;

#[async_trait]
impl Entrypoint for NetworkSpeedPlugin {
    async fn invoke(&self, ctx: InvocationContext) -> anyhow::Result<Placeholders> {
        let units = SpeedUnits::parse(ctx.setting_str("units").unwrap_or("mbps"));
        let show_icons = ctx.setting_bool("show_icons").unwrap_or(true);
        let interface = ctx.setting_str("interface").unwrap_or("auto");

        // The engine's monitor keeps this fresh in watch mode
        let published = ctx.cache
            .lookup(&sample_key())
            .and_then(|entry| NetworkSample::from_placeholders(&entry.placeholders))
            .filter(|sample| interface == "auto" || sample.interface == interface);

        let sample = match published {
            Some(sample) => sample,
            None =>
                sample_network(&ctx.cache, interface).await.context(
                    "No network interfaces available"
                )?,
        };

        let (down_icon, up_icon) = if show_icons { (Some("↓"), Some("↑")) } else { (None, None) };
        let download = format_speed(sample.download_bps, units, down_icon);
        let upload = format_speed(sample.upload_bps, units, up_icon);

        Ok(
            Placeholders::from([
                ("net_speed".to_string(), format!("{} {}", download, upload)),
                ("download_speed".to_string(), download),
                ("upload_speed".to_string(), upload),
                (
                    "network_usage".to_string(),
                    format_usage(sample.session_received, sample.session_transmitted),
                ),
                ("network_interface".to_string(), sample.interface),
            ])
        )
    }
}

/// Sampling interval for the network monitor from the plugin's settings
pub fn network_interval(settings: &toml::Table) -> Duration {
    let secs = settings
        .get("interval")
        .and_then(|value| value.as_integer())
        .and_then(|secs| u64::try_from(secs).ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_NETWORK_INTERVAL_SECS);
    Duration::from_secs(secs)
}
