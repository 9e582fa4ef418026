//! # bandlink-adapter-ble
//!
//! BLE adapter: implements the [`Transport`] port on top of `btleplug`, so
//! the tracker protocol in `bandlink-app` can drive a real Mi Band 3.
//!
//! ## How it works
//!
//! - Scanning maps `CentralEvent::DeviceDiscovered` / `DeviceUpdated` into
//!   [`Advertisement`]s. The peripheral must have been seen by a scan before
//!   it can be connected.
//! - Connecting discovers services once; characteristics are then looked up
//!   by UUID per operation.
//! - Writes are always with response.
//!
//! ## Dependency rule
//!
//! Same as other adapters: depends on `bandlink-app` and `bandlink-domain`.

mod config;
mod error;
mod gatt;
mod scanner;

pub use config::BleConfig;
pub use error::BleError;

use std::sync::Mutex;

use btleplug::api::{BDAddr, Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::ReceiverStream;

use bandlink_app::ports::{Advertisement, AdvertisementStream, NotificationStream, Transport};
use bandlink_domain::address::DeviceAddress;
use bandlink_domain::error::{BandError, ConnectionError, DiscoveryError, GattOp};

/// Room for advertisements not yet consumed by the discovery task.
const ADVERTISEMENT_BUFFER: usize = 32;

/// Transport backed by one host BLE adapter.
pub struct BleTransport {
    central: Adapter,
    scan: Mutex<Option<AbortHandle>>,
}

/// An open link to one peripheral.
#[derive(Clone)]
pub struct BleConnection {
    peripheral: Peripheral,
    address: DeviceAddress,
}

impl BleConnection {
    #[must_use]
    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

impl std::fmt::Debug for BleConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleConnection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl BleTransport {
    /// Open the configured host adapter.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::NotAvailable`] when the host has no adapter at the
    /// configured index, or [`BleError::Radio`] when the BLE stack fails.
    pub async fn new(config: &BleConfig) -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .nth(config.adapter_index)
            .ok_or(BleError::NotAvailable {
                index: config.adapter_index,
            })?;
        match central.adapter_info().await {
            Ok(info) => tracing::info!(adapter = %info, "BLE adapter ready"),
            Err(err) => tracing::debug!(%err, "BLE adapter info unavailable"),
        }
        Ok(Self {
            central,
            scan: Mutex::new(None),
        })
    }

    fn replace_scan(&self, task: Option<AbortHandle>) {
        let previous = {
            let mut scan = self
                .scan
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::replace(&mut *scan, task)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Find a peripheral the adapter already knows about.
    async fn find(&self, address: DeviceAddress) -> Result<Peripheral, BandError> {
        let target = BDAddr::from(address.as_bytes());
        let peripherals = self
            .central
            .peripherals()
            .await
            .map_err(|err| BandError::from(DiscoveryError::Scan(Box::new(err))))?;
        peripherals
            .into_iter()
            .find(|p| p.address() == target)
            .ok_or_else(|| ConnectionError::UnknownDevice { address }.into())
    }
}

impl Transport for BleTransport {
    type Connection = BleConnection;

    async fn start_scan(&self) -> Result<AdvertisementStream, BandError> {
        let events = self.central.events().await.map_err(BleError::from)?;
        self.central
            .start_scan(ScanFilter::default())
            .await
            .map_err(BleError::from)?;
        tracing::debug!("BLE scan started");

        let (sender, receiver) = mpsc::channel::<Advertisement>(ADVERTISEMENT_BUFFER);
        let task = tokio::spawn(scanner::forward(self.central.clone(), events, sender));
        self.replace_scan(Some(task.abort_handle()));
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn stop_scan(&self) -> Result<(), BandError> {
        self.replace_scan(None);
        self.central.stop_scan().await.map_err(BleError::from)?;
        tracing::debug!("BLE scan stopped");
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> Result<BleConnection, BandError> {
        let peripheral = self.find(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|err| error::refused(address, err))?;
        if let Err(err) = peripheral.discover_services().await {
            if let Err(close) = peripheral.disconnect().await {
                tracing::warn!(%close, "failed to close link after service discovery failed");
            }
            return Err(error::refused(address, err));
        }
        tracing::debug!(
            %address,
            characteristics = peripheral.characteristics().len(),
            "services discovered"
        );
        Ok(BleConnection {
            peripheral,
            address,
        })
    }

    async fn disconnect(&self, connection: &BleConnection) -> Result<(), BandError> {
        match connection.peripheral.disconnect().await {
            Ok(()) | Err(btleplug::Error::NotConnected) => Ok(()),
            Err(err) => Err(ConnectionError::Refused {
                address: connection.address,
                source: Some(Box::new(err)),
            }
            .into()),
        }
    }

    async fn write(
        &self,
        connection: &BleConnection,
        characteristic: uuid::Uuid,
        bytes: &[u8],
    ) -> Result<(), BandError> {
        let target = gatt::find_characteristic(&connection.peripheral, characteristic)?;
        connection
            .peripheral
            .write(&target, bytes, WriteType::WithResponse)
            .await
            .map_err(|err| error::gatt(GattOp::Write, characteristic, err))
    }

    async fn read(
        &self,
        connection: &BleConnection,
        characteristic: uuid::Uuid,
    ) -> Result<Vec<u8>, BandError> {
        let target = gatt::find_characteristic(&connection.peripheral, characteristic)?;
        connection
            .peripheral
            .read(&target)
            .await
            .map_err(|err| error::gatt(GattOp::Read, characteristic, err))
    }

    async fn subscribe(
        &self,
        connection: &BleConnection,
        characteristic: uuid::Uuid,
    ) -> Result<NotificationStream, BandError> {
        let target = gatt::find_characteristic(&connection.peripheral, characteristic)?;
        // take the stream first so the first notification is not missed
        let stream = gatt::notifications(&connection.peripheral, characteristic).await?;
        connection
            .peripheral
            .subscribe(&target)
            .await
            .map_err(|err| error::gatt(GattOp::Subscribe, characteristic, err))?;
        Ok(stream)
    }

    async fn unsubscribe(
        &self,
        connection: &BleConnection,
        characteristic: uuid::Uuid,
    ) -> Result<(), BandError> {
        let target = gatt::find_characteristic(&connection.peripheral, characteristic)?;
        connection
            .peripheral
            .unsubscribe(&target)
            .await
            .map_err(|err| error::gatt(GattOp::Unsubscribe, characteristic, err))
    }
}
