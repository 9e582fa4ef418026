//! Subcommand bodies. Results go to stdout as JSON lines; logs go to stderr.

use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_stream::StreamExt;

use bandlink_app::Band;
use bandlink_app::ports::Transport;
use bandlink_domain::address::DeviceAddress;
use bandlink_domain::device::DeviceHandle;
use bandlink_domain::key::AuthKey;
use bandlink_domain::time;

use crate::config::Config;

/// What to do once the adapter is up.
#[derive(Debug, Clone, clap::Subcommand)]
pub enum Command {
    /// List nearby bands.
    Search {
        /// Scan duration; defaults to `scan.timeout_ms`.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Pair from scratch and print the new key.
    Pair,
    /// Push the configured user profile and preferences.
    Configure,
    /// Print battery, revisions and the band clock.
    Info,
    /// Stream live heart rate until interrupted.
    LiveHr {
        /// Stop after this many seconds.
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Print recorded minutes.
    Fetch {
        /// RFC 3339 start; defaults to 24 hours ago.
        #[arg(long)]
        since: Option<DateTime<FixedOffset>>,
    },
}

/// Device selection from the command line; falls back to the config file.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub address: Option<DeviceAddress>,
    pub key: Option<AuthKey>,
}

fn emit(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Run `command` against `band`, disconnecting afterwards.
///
/// # Errors
///
/// Returns the first failure, with context for the step that failed.
pub async fn run<T: Transport>(
    band: &Band<T>,
    config: &Config,
    target: Target,
    command: Command,
) -> anyhow::Result<()> {
    if let Command::Search { timeout_ms } = command {
        let timeout = timeout_ms.map_or_else(|| config.scan_timeout(), Duration::from_millis);
        return search(band, timeout).await;
    }

    let result = connected(band, config, target, command).await;
    if band.is_connected() {
        band.disconnect().await;
    }
    result
}

async fn search<T: Transport>(band: &Band<T>, timeout: Duration) -> anyhow::Result<()> {
    let mut discovery = band.search(timeout).await.context("starting scan")?;
    let mut found = 0usize;
    while let Some(device) = discovery.next().await {
        emit(&device)?;
        found += 1;
    }
    tracing::info!(found, "scan finished");
    Ok(())
}

async fn connected<T: Transport>(
    band: &Band<T>,
    config: &Config,
    target: Target,
    command: Command,
) -> anyhow::Result<()> {
    let full = matches!(command, Command::Pair);
    open(band, config, target, full).await?;

    match command {
        Command::Search { .. } | Command::Pair => Ok(()),
        Command::Configure => {
            let profile = config.user.profile()?;
            band.configure_with(&profile, &config.preferences, config.device.heart_rate_interval)
                .await
                .context("configuring band")?;
            emit(&json!({ "configured": true }))
        }
        Command::Info => {
            let info = band.device_info().await.context("reading device info")?;
            emit(&info)
        }
        Command::LiveHr { seconds } => live_heart_rate(band, seconds.map(Duration::from_secs)).await,
        Command::Fetch { since } => {
            let since = since.map_or_else(|| time::now() - chrono::Duration::hours(24), |since| since.with_timezone(&Utc));
            let mut samples = band.stored_data(since).await.context("requesting history")?;
            let mut delivered = 0usize;
            while let Some(sample) = samples.next().await {
                emit(&sample.context("receiving history")?)?;
                delivered += 1;
            }
            tracing::info!(delivered, "history fetched");
            Ok(())
        }
    }
}

/// Connect and authenticate, pairing when forced or when no key is known.
async fn open<T: Transport>(
    band: &Band<T>,
    config: &Config,
    target: Target,
    force_pairing: bool,
) -> anyhow::Result<()> {
    let address = match target.address.or(config.address()?) {
        Some(address) => address,
        None => first_found(band, config).await?,
    };
    let key = if force_pairing { None } else { target.key.or(config.key()?) };
    let full = key.is_none();
    let handle = match key {
        Some(key) => DeviceHandle::with_key(address, key),
        None => DeviceHandle::new(address),
    };

    band.connect(handle)
        .await
        .with_context(|| format!("connecting to {address}"))?;
    if full {
        tracing::info!(%address, "pairing, tap the band to confirm");
    }
    band.authenticate(full).await.context("authenticating")?;

    if full {
        if let Some(key) = band.authentication_key() {
            emit(&json!({ "address": address, "key": key.to_hex() }))?;
        }
    }
    Ok(())
}

async fn first_found<T: Transport>(band: &Band<T>, config: &Config) -> anyhow::Result<DeviceAddress> {
    let mut discovery = band
        .search(config.scan_timeout())
        .await
        .context("starting scan")?;
    let Some(device) = discovery.next().await else {
        bail!("no band named {:?} found", config.device.name);
    };
    discovery.cancel();
    tracing::info!(address = %device.address, "using first band found");
    Ok(device.address)
}

async fn live_heart_rate<T: Transport>(band: &Band<T>, limit: Option<Duration>) -> anyhow::Result<()> {
    let mut samples = band.start_live_hr().await.context("starting live heart rate")?;
    let subscription = samples.subscription();
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let result = loop {
        tokio::select! {
            sample = samples.next() => match sample {
                Some(Ok(sample)) => emit(&sample)?,
                Some(Err(err)) => break Err(err).context("live heart rate"),
                None => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break Ok(()),
            () = &mut deadline => break Ok(()),
        }
    };
    band.stop_live_hr(subscription).await;
    result
}
