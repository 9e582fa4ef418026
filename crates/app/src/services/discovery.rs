//! Discovery: finite, name-filtered scans.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::{Stream, StreamExt};

use bandlink_domain::device::DiscoveredDevice;
use bandlink_domain::error::BandError;

use crate::ports::{AdvertisementStream, Transport};

/// What to look for and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    /// Exact advertised name to keep.
    pub name: String,
    pub timeout: Duration,
}

/// A running scan, yielding each matching device once.
///
/// The scan ends at the timeout, on [`Discovery::cancel`], or when the
/// `Discovery` is dropped. In every case the radio is told to stop scanning
/// exactly once, before the sequence reports its end.
pub struct Discovery {
    receiver: mpsc::Receiver<DiscoveredDevice>,
    cancel: Option<oneshot::Sender<()>>,
}

impl Discovery {
    /// Stop scanning early. Devices already found may still be yielded.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Drain the scan into a list.
    pub async fn collect_all(mut self) -> Vec<DiscoveredDevice> {
        let mut devices = Vec::new();
        while let Some(device) = self.receiver.recv().await {
            devices.push(device);
        }
        devices
    }
}

impl Stream for Discovery {
    type Item = DiscoveredDevice;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Start a scan on `transport`.
///
/// # Errors
///
/// Returns whatever the transport reports when the scan cannot start
/// (typically a `DiscoveryError`).
#[tracing::instrument(skip(transport), fields(name = %options.name, timeout = ?options.timeout))]
pub async fn search<T: Transport>(
    transport: Arc<T>,
    options: SearchOptions,
) -> Result<Discovery, BandError> {
    let adverts = transport.start_scan().await?;
    let (sender, receiver) = mpsc::channel(16);
    let (cancel, cancelled) = oneshot::channel();
    tokio::spawn(scan(transport, adverts, options, sender, cancelled));
    Ok(Discovery {
        receiver,
        cancel: Some(cancel),
    })
}

async fn scan<T: Transport>(
    transport: Arc<T>,
    mut adverts: AdvertisementStream,
    options: SearchOptions,
    sender: mpsc::Sender<DiscoveredDevice>,
    mut cancelled: oneshot::Receiver<()>,
) {
    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);
    let mut seen = HashSet::new();

    loop {
        tokio::select! {
            () = &mut deadline => {
                tracing::debug!("scan timed out");
                break;
            }
            _ = &mut cancelled => {
                tracing::debug!("scan cancelled");
                break;
            }
            advert = adverts.next() => {
                let Some(advert) = advert else {
                    tracing::debug!("advertisement stream ended");
                    break;
                };
                if advert.name.as_deref() != Some(options.name.as_str()) {
                    continue;
                }
                if !seen.insert(advert.address) {
                    continue;
                }
                tracing::info!(address = %advert.address, rssi = ?advert.rssi, "found device");
                let device = DiscoveredDevice {
                    address: advert.address,
                    name: options.name.clone(),
                    rssi: advert.rssi,
                };
                tokio::select! {
                    sent = sender.send(device) => if sent.is_err() { break },
                    _ = &mut cancelled => break,
                    () = &mut deadline => break,
                }
            }
        }
    }

    drop(adverts);
    if let Err(err) = transport.stop_scan().await {
        tracing::warn!(error = %err, "failed to stop scan");
    }
    // `sender` drops last, so consumers see the end only after the scan stopped
    drop(sender);
}
