//! # bandlink-adapter-virtual
//!
//! Virtual adapter: a simulated Mi Band 3 behind the [`Transport`] port, for
//! tests and for running the CLI without hardware (`--simulate`).
//!
//! ## Behaviour
//!
//! | Characteristic | Behaviour |
//! |----------------|-----------|
//! | auth | Stores the sent key, issues random challenges, checks responses with the stored key |
//! | current time | Sets and reports the band clock |
//! | heart rate control | Continuous measurement on/off; pushes `[0x00, bpm]` every `heart_rate_period` while on |
//! | fetch control / activity data | Serves [`History`] minutes at or after the requested start |
//! | battery, revisions | Fixed values from [`VirtualBand`] |
//! | configuration, user settings | Accepted and journaled |
//!
//! Scans advertise the band plus one unrelated device. [`Faults`] injects
//! failures; [`VirtualTransport::drop_link`] simulates the band walking out
//! of range.
//!
//! ## Dependency rule
//!
//! Depends on `bandlink-app` (port trait, codecs) and `bandlink-domain` only.

mod device;
mod firmware;

pub use device::{Faults, History, Journal, VirtualBand};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::AbortHandle;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use bandlink_app::ports::{Advertisement, AdvertisementStream, NotificationStream, Transport};
use bandlink_app::protocol::{Channel, MI_BAND_3};
use bandlink_domain::address::DeviceAddress;
use bandlink_domain::error::{BandError, ConnectionError, TransportError};
use bandlink_domain::key::AuthKey;

use firmware::{Effect, Firmware};

const NOTIFICATION_BUFFER: usize = 64;

/// An open link to the simulated band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualConnection {
    id: u64,
}

struct State {
    firmware: Firmware,
    journal: Journal,
    link: Option<u64>,
    next_link: u64,
    subscribers: HashMap<Uuid, mpsc::Sender<Vec<u8>>>,
    scan: Option<mpsc::Sender<Advertisement>>,
    live: Option<AbortHandle>,
}

impl State {
    fn check(&self, connection: &VirtualConnection) -> Result<(), BandError> {
        if self.link == Some(connection.id) {
            Ok(())
        } else {
            Err(TransportError::NotConnected.into())
        }
    }

    /// End the link: streams close, live measurement stops.
    fn unlink(&mut self) {
        self.link = None;
        self.subscribers.clear();
        if let Some(live) = self.live.take() {
            live.abort();
        }
    }
}

/// Transport talking to one in-process [`VirtualBand`].
///
/// Cheap to clone; clones share the band.
#[derive(Clone)]
pub struct VirtualTransport {
    state: Arc<Mutex<State>>,
}

impl Default for VirtualTransport {
    fn default() -> Self {
        Self::new(VirtualBand::default())
    }
}

impl VirtualTransport {
    #[must_use]
    pub fn new(band: VirtualBand) -> Self {
        Self::with_faults(band, Faults::default())
    }

    #[must_use]
    pub fn with_faults(band: VirtualBand, faults: Faults) -> Self {
        let mut firmware = Firmware::new(band, &MI_BAND_3);
        firmware.faults = faults;
        Self {
            state: Arc::new(Mutex::new(State {
                firmware,
                journal: Journal::default(),
                link: None,
                next_link: 1,
                subscribers: HashMap::new(),
                scan: None,
                live: None,
            })),
        }
    }

    /// Replace the injected faults; applies to the next write.
    pub async fn set_faults(&self, faults: Faults) {
        self.state.lock().await.firmware.faults = faults;
    }

    /// What the host has done so far.
    pub async fn journal(&self) -> Journal {
        self.state.lock().await.journal.clone()
    }

    /// Snapshot of the band as the host left it.
    pub async fn band(&self) -> VirtualBand {
        self.state.lock().await.firmware.band.clone()
    }

    /// The key the band was paired with.
    pub async fn paired_key(&self) -> Option<AuthKey> {
        self.state.lock().await.firmware.band.key.clone()
    }

    /// Lose the link without the host asking: streams end, writes fail.
    pub async fn drop_link(&self) {
        tracing::info!("dropping virtual link");
        self.state.lock().await.unlink();
    }

    async fn subscriber(&self, channel: Channel) -> Option<mpsc::Sender<Vec<u8>>> {
        let uuid = MI_BAND_3.uuid(channel).ok()?;
        self.state.lock().await.subscribers.get(&uuid).cloned()
    }

    async fn run(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify(uuid, bytes) => {
                    let sender = self.state.lock().await.subscribers.get(&uuid).cloned();
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(bytes).await;
                        }
                        None => tracing::debug!(%uuid, "notification without subscriber dropped"),
                    }
                }
                Effect::StartLive => {
                    let (values, period) = {
                        let state = self.state.lock().await;
                        let band = &state.firmware.band;
                        (band.heart_rates.clone(), band.heart_rate_period)
                    };
                    let task = tokio::spawn(push_heart_rate(self.clone(), values, period));
                    if let Some(previous) = self.state.lock().await.live.replace(task.abort_handle()) {
                        previous.abort();
                    }
                }
                Effect::StopLive => {
                    if let Some(live) = self.state.lock().await.live.take() {
                        live.abort();
                    }
                }
                Effect::Transfer { packets, done } => {
                    tokio::spawn(transfer(self.clone(), packets, done));
                }
            }
        }
    }
}

async fn push_heart_rate(transport: VirtualTransport, values: Vec<u8>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    for value in values.iter().cycle() {
        interval.tick().await;
        if let Some(sender) = transport.subscriber(Channel::HeartRateMeasurement).await {
            let _ = sender.send(vec![0x00, *value]).await;
        }
    }
}

async fn transfer(transport: VirtualTransport, packets: Vec<Vec<u8>>, done: Vec<u8>) {
    let Some(data) = transport.subscriber(Channel::ActivityData).await else {
        tracing::warn!("history requested without an activity subscriber");
        return;
    };
    for packet in packets {
        if data.send(packet).await.is_err() {
            return;
        }
    }
    if let Some(control) = transport.subscriber(Channel::FetchControl).await {
        let _ = control.send(done).await;
    }
}

impl Transport for VirtualTransport {
    type Connection = VirtualConnection;

    async fn start_scan(&self) -> Result<AdvertisementStream, BandError> {
        let (sender, receiver) = mpsc::channel(4);
        let mut state = self.state.lock().await;
        let band = &state.firmware.band;
        let adverts = [
            Advertisement {
                address: DeviceAddress::new([0x5a, 0x11, 0x00, 0x2c, 0x9e, 0x07]),
                name: Some("Kettle".to_owned()),
                rssi: Some(-81),
            },
            Advertisement {
                address: band.address,
                name: Some(band.name.clone()),
                rssi: Some(-58),
            },
        ];
        for advert in adverts {
            let _ = sender.try_send(advert);
        }
        state.scan = Some(sender);
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn stop_scan(&self) -> Result<(), BandError> {
        let mut state = self.state.lock().await;
        state.scan = None;
        state.journal.stop_scans += 1;
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> Result<VirtualConnection, BandError> {
        let mut state = self.state.lock().await;
        if address != state.firmware.band.address {
            return Err(ConnectionError::UnknownDevice { address }.into());
        }
        state.unlink();
        let id = state.next_link;
        state.next_link += 1;
        state.link = Some(id);
        tracing::debug!(%address, link = id, "virtual link up");
        Ok(VirtualConnection { id })
    }

    async fn disconnect(&self, connection: &VirtualConnection) -> Result<(), BandError> {
        let mut state = self.state.lock().await;
        if state.link == Some(connection.id) {
            state.unlink();
        }
        Ok(())
    }

    async fn write(
        &self,
        connection: &VirtualConnection,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<(), BandError> {
        let effects = {
            let mut state = self.state.lock().await;
            state.check(connection)?;
            state.journal.writes.push((characteristic, bytes.to_vec()));
            state.firmware.handle(characteristic, bytes)?
        };
        self.run(effects).await;
        Ok(())
    }

    async fn read(
        &self,
        connection: &VirtualConnection,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BandError> {
        let state = self.state.lock().await;
        state.check(connection)?;
        state.firmware.read(characteristic)
    }

    async fn subscribe(
        &self,
        connection: &VirtualConnection,
        characteristic: Uuid,
    ) -> Result<NotificationStream, BandError> {
        let mut state = self.state.lock().await;
        state.check(connection)?;
        state.firmware.check(characteristic)?;
        let (sender, receiver) = mpsc::channel(NOTIFICATION_BUFFER);
        state.subscribers.insert(characteristic, sender);
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn unsubscribe(
        &self,
        connection: &VirtualConnection,
        characteristic: Uuid,
    ) -> Result<(), BandError> {
        let mut state = self.state.lock().await;
        state.check(connection)?;
        state.subscribers.remove(&characteristic);
        state.journal.unsubscribes.push(characteristic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    fn uuid(channel: Channel) -> Uuid {
        MI_BAND_3.uuid(channel).unwrap()
    }

    async fn connected() -> (VirtualTransport, VirtualConnection) {
        let transport = VirtualTransport::default();
        let address = transport.band().await.address;
        let connection = transport.connect(address).await.unwrap();
        (transport, connection)
    }

    #[tokio::test]
    async fn should_advertise_band_and_decoy() {
        let transport = VirtualTransport::default();
        let mut adverts = transport.start_scan().await.unwrap();

        let first = adverts.next().await.unwrap();
        let second = adverts.next().await.unwrap();
        assert_eq!(first.name.as_deref(), Some("Kettle"));
        assert_eq!(second.name.as_deref(), Some("Mi Band 3"));

        transport.stop_scan().await.unwrap();
        assert!(adverts.next().await.is_none());
        assert_eq!(transport.journal().await.stop_scans, 1);
    }

    #[tokio::test]
    async fn should_refuse_unknown_address() {
        let transport = VirtualTransport::default();
        let err = transport
            .connect(DeviceAddress::new([1, 2, 3, 4, 5, 6]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BandError::Connection(ConnectionError::UnknownDevice { .. })
        ));
    }

    #[tokio::test]
    async fn should_notify_auth_subscriber_on_key_exchange() {
        let (transport, connection) = connected().await;
        let mut auth = transport.subscribe(&connection, uuid(Channel::Auth)).await.unwrap();
        let mut send_key = vec![0x01, 0x00];
        send_key.extend_from_slice(&[3; 16]);

        transport
            .write(&connection, uuid(Channel::Auth), &send_key)
            .await
            .unwrap();

        assert_eq!(auth.next().await, Some(vec![0x10, 0x01, 0x01]));
        assert_eq!(transport.paired_key().await, Some(AuthKey::new([3; 16])));
    }

    #[tokio::test]
    async fn should_end_streams_and_fail_writes_after_link_drop() {
        let (transport, connection) = connected().await;
        let mut auth = transport.subscribe(&connection, uuid(Channel::Auth)).await.unwrap();

        transport.drop_link().await;

        assert!(auth.next().await.is_none());
        let err = transport
            .write(&connection, uuid(Channel::Auth), &[0x02, 0x00])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BandError::Transport(TransportError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn should_push_heart_rate_while_continuous_measurement_runs() {
        let (transport, connection) = connected().await;
        let control = uuid(Channel::HeartRateControl);
        let mut measurements = transport
            .subscribe(&connection, uuid(Channel::HeartRateMeasurement))
            .await
            .unwrap();

        transport
            .write(&connection, control, &[0x15, 0x01, 0x01])
            .await
            .unwrap();
        assert_eq!(measurements.next().await, Some(vec![0x00, 72]));
        assert_eq!(measurements.next().await, Some(vec![0x00, 74]));

        transport
            .write(&connection, control, &[0x15, 0x01, 0x00])
            .await
            .unwrap();
        let quiet = tokio::time::timeout(Duration::from_secs(5), measurements.next()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn should_journal_writes_and_unsubscribes() {
        let (transport, connection) = connected().await;
        let config = uuid(Channel::Configuration);
        transport.subscribe(&connection, config).await.unwrap();
        transport
            .write(&connection, config, &[0x06, 0x03, 0x00, 0x00])
            .await
            .unwrap();
        transport.unsubscribe(&connection, config).await.unwrap();

        let journal = transport.journal().await;
        assert_eq!(journal.written(), vec![vec![0x06, 0x03, 0x00, 0x00]]);
        assert_eq!(journal.unsubscribes, vec![config]);
    }

    #[tokio::test]
    async fn should_invalidate_old_connection_on_reconnect() {
        let (transport, old) = connected().await;
        let address = transport.band().await.address;
        let new = transport.connect(address).await.unwrap();

        assert!(transport.read(&old, uuid(Channel::Battery)).await.is_err());
        assert_eq!(
            transport.read(&new, uuid(Channel::Battery)).await.unwrap(),
            vec![0x0f, 87, 0]
        );
    }
}
