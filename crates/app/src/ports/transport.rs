//! Transport port: the radio capabilities the protocol needs.
//!
//! A transport scans for advertisements, opens links, and exchanges raw
//! characteristic values. It knows nothing about the tracker protocol: the
//! services above it decide which bytes go where.

use std::future::Future;
use std::pin::Pin;

use tokio_stream::Stream;
use uuid::Uuid;

use bandlink_domain::address::DeviceAddress;
use bandlink_domain::error::BandError;

/// One advertisement heard during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    /// Advertised local name, when the packet carried one.
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Advertisements in arrival order. Ends when the scan stops.
pub type AdvertisementStream = Pin<Box<dyn Stream<Item = Advertisement> + Send>>;

/// Notification values of one characteristic in arrival order.
///
/// Ends when the subscription is dropped or the link goes away.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A BLE central able to talk to one kind of peripheral.
///
/// Implementations live in adapter crates (`adapters/ble`, `adapters/virtual`).
/// Errors are mapped into [`BandError`] by the adapter; link loss must surface
/// as `TransportError::NotConnected` or `ConnectionError::Dropped` so the
/// session can tell it apart from protocol failures.
pub trait Transport: Send + Sync + 'static {
    /// Handle to an open link. Cheap to clone.
    type Connection: Clone + Send + Sync + 'static;

    /// Start scanning and return the advertisement stream.
    fn start_scan(&self) -> impl Future<Output = Result<AdvertisementStream, BandError>> + Send;

    /// Stop a running scan.
    fn stop_scan(&self) -> impl Future<Output = Result<(), BandError>> + Send;

    /// Open a link and discover its characteristics.
    fn connect(
        &self,
        address: DeviceAddress,
    ) -> impl Future<Output = Result<Self::Connection, BandError>> + Send;

    /// Close a link. Closing an already closed link is not an error.
    fn disconnect(
        &self,
        connection: &Self::Connection,
    ) -> impl Future<Output = Result<(), BandError>> + Send;

    /// Write with response; resolves once the peripheral acknowledged.
    fn write(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), BandError>> + Send;

    /// Read the current value of a characteristic.
    fn read(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<Vec<u8>, BandError>> + Send;

    /// Enable notifications and return them as a stream.
    fn subscribe(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<NotificationStream, BandError>> + Send;

    /// Disable notifications for a characteristic.
    fn unsubscribe(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<(), BandError>> + Send;
}
