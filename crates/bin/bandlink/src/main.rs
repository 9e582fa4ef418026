//! # bandlink: Mi Band 3 command-line tool
//!
//! Composition root that wires an adapter into the band facade.
//!
//! ## Responsibilities
//! - Parse configuration (CLI args, env vars, config file)
//! - Install the `tracing` subscriber (stderr, `EnvFilter`)
//! - Construct the BLE transport, or the virtual one with `--simulate`
//! - Run one subcommand and print its results as JSON lines
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer: no protocol logic belongs here.

mod commands;
mod config;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bandlink_adapter_ble::{BleConfig, BleTransport};
use bandlink_adapter_virtual::VirtualTransport;
use bandlink_app::Band;
use bandlink_domain::address::DeviceAddress;
use bandlink_domain::key::AuthKey;

use commands::{Command, Target};
use config::{Config, LoggingConfig};

#[derive(Debug, Parser)]
#[command(name = "bandlink", version, about = "Talk to a Mi Band 3 over Bluetooth LE")]
struct Cli {
    /// Config file; defaults to `bandlink.toml` when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Drive a simulated band instead of the radio.
    #[arg(long, global = true)]
    simulate: bool,
    /// Band address, overriding `device.address`.
    #[arg(long, global = true)]
    address: Option<DeviceAddress>,
    /// Hex key, overriding `device.key`.
    #[arg(long, global = true)]
    key: Option<AuthKey>,
    #[command(subcommand)]
    command: Command,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    let target = Target {
        address: cli.address,
        key: cli.key,
    };
    let timeouts = config.timeouts.to_timeouts();

    if cli.simulate {
        tracing::info!("using simulated band");
        let band = Band::with_timeouts(VirtualTransport::default(), timeouts)
            .with_name(config.device.name.clone());
        commands::run(&band, &config, target, cli.command).await
    } else {
        let ble = BleConfig {
            adapter_index: config.device.adapter_index,
        };
        let transport = BleTransport::new(&ble)
            .await
            .context("opening bluetooth adapter")?;
        let band = Band::with_timeouts(transport, timeouts).with_name(config.device.name.clone());
        commands::run(&band, &config, target, cli.command).await
    }
}
