//! Telemetry: live heart rate, stored history and device info.
//!
//! Live and historical deliveries run in background tasks registered with the
//! session, and reach the caller through a [`SampleStream`] backed by a
//! capacity-1 channel: the producer waits for the consumer, so nothing is
//! buffered beyond one in-flight sample.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Duration as MinuteStep;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};

use bandlink_domain::device::DeviceInfo;
use bandlink_domain::error::{BandError, ConnectionError, ProtocolError, TransportError};
use bandlink_domain::telemetry::{ActivityKind, ActivityRecord, TelemetrySample};
use bandlink_domain::time::{self, Timestamp};

use crate::ports::{NotificationStream, Transport};
use crate::protocol::codec;
use crate::protocol::{Channel, CommandId};
use crate::services::session::{Link, Session, StreamEnd, StreamKind, with_timeout};

/// Item of a [`SampleStream`].
pub type SampleResult = Result<TelemetrySample, BandError>;

/// Identifies a running live stream, for [`stop_live_heart_rate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Samples in arrival order.
///
/// A stream that ends abnormally yields one `Err` first; one closed by
/// disconnect yields [`ConnectionError::Closed`], and one cut short because
/// another exchange failed yields [`ConnectionError::Dropped`] (link lost)
/// or [`ConnectionError::Interrupted`]. A stopped stream simply ends. After
/// either, no further sample is yielded.
pub struct SampleStream {
    receiver: mpsc::Receiver<SampleResult>,
    end: Arc<StreamEnd>,
    subscription: Subscription,
    finished: bool,
}

impl SampleStream {
    fn new(
        receiver: mpsc::Receiver<SampleResult>,
        end: Arc<StreamEnd>,
        subscription: Subscription,
    ) -> Self {
        Self {
            receiver,
            end,
            subscription,
            finished: false,
        }
    }

    /// A stream that ends at once, successfully.
    fn empty() -> Self {
        let (_, receiver) = mpsc::channel(1);
        Self::new(receiver, Arc::default(), Subscription(u64::MAX))
    }

    #[must_use]
    pub fn subscription(&self) -> Subscription {
        self.subscription
    }

    /// Check for an outside end, before and after each item.
    fn ended(&mut self) -> Option<Option<SampleResult>> {
        if let Some(err) = self.end.failure() {
            self.finished = true;
            return Some(Some(Err(err.into())));
        }
        if self.end.is_stopped() {
            self.finished = true;
            return Some(None);
        }
        None
    }
}

impl Stream for SampleStream {
    type Item = SampleResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if let Some(item) = self.ended() {
            return Poll::Ready(item);
        }
        let item = match self.receiver.poll_recv(cx) {
            Poll::Ready(item) => item,
            Poll::Pending => return Poll::Pending,
        };
        // the end may have been signalled while the item was in flight
        if let Some(item) = self.ended() {
            return Poll::Ready(item);
        }
        match &item {
            Some(Err(_)) | None => self.finished = true,
            Some(Ok(_)) => {}
        }
        Poll::Ready(item)
    }
}

/// Start continuous heart-rate measurement.
///
/// # Errors
///
/// - [`BandError::NotAuthenticated`] unless the session is authenticated
/// - [`BandError::StreamActive`] when a live stream already runs
/// - transport failures while enabling measurement
#[tracing::instrument(skip(session))]
pub async fn start_live_heart_rate<T: Transport>(
    session: &Session<T>,
) -> Result<SampleStream, BandError> {
    const OPERATION: &str = "start_live_heart_rate";
    if session.has_stream(StreamKind::LiveHeartRate) {
        return Err(BandError::StreamActive {
            kind: StreamKind::LiveHeartRate.as_str(),
        });
    }
    let link = session.acquire(OPERATION).await?;
    let end = Arc::new(StreamEnd::default());
    let id = session.register_stream(link.epoch(), StreamKind::LiveHeartRate, Arc::clone(&end))?;

    let result = enable_heart_rate(session, &link).await;
    let notifications = match session.settle(&link, result) {
        Ok(notifications) => notifications,
        Err(err) => {
            session.release_stream(id);
            return Err(err);
        }
    };
    let epoch = link.epoch();
    drop(link);

    let (sender, receiver) = mpsc::channel(1);
    let forwarder = tokio::spawn(forward_heart_rate(
        session.clone(),
        epoch,
        id,
        notifications,
        sender,
    ));
    session.attach_task(id, forwarder.abort_handle());
    let pinger = tokio::spawn(keep_alive(session.clone()));
    session.attach_task(id, pinger.abort_handle());
    tracing::info!("live heart rate started");
    Ok(SampleStream::new(receiver, end, Subscription(id)))
}

async fn enable_heart_rate<T: Transport>(
    session: &Session<T>,
    link: &Link<T::Connection>,
) -> Result<NotificationStream, BandError> {
    const OPERATION: &str = "start_live_heart_rate";
    let table = session.table();
    let notifications = session
        .subscribe(link, Channel::HeartRateMeasurement, OPERATION)
        .await?;
    for (command, payload) in [
        (CommandId::HeartRateManual, 0),
        (CommandId::HeartRateContinuous, 0),
        (CommandId::HeartRateContinuous, 1),
    ] {
        let frame = table.frame(command, &[payload])?;
        session.write(link, &frame, OPERATION).await?;
    }
    Ok(notifications)
}

async fn forward_heart_rate<T: Transport>(
    session: Session<T>,
    epoch: u64,
    id: u64,
    mut notifications: NotificationStream,
    sender: mpsc::Sender<SampleResult>,
) {
    let abandoned = loop {
        let next = tokio::select! {
            () = sender.closed() => break true,
            next = notifications.next() => next,
        };
        let Some(value) = next else {
            let err: BandError = match session.table().uuid(Channel::HeartRateMeasurement) {
                Ok(characteristic) => TransportError::StreamClosed { characteristic }.into(),
                Err(err) => err.into(),
            };
            session.fail_stream(id, epoch, &err);
            let _ = sender.send(Err(err)).await;
            break false;
        };
        match codec::decode_heart_rate(&value) {
            Ok(raw) => {
                let sample = TelemetrySample::heart_rate(raw, time::now());
                tracing::trace!(?sample, "heart rate");
                if sender.send(Ok(sample)).await.is_err() {
                    break true;
                }
            }
            Err(err) => tracing::warn!(error = %err, "skipping malformed heart rate notification"),
        }
    };
    if abandoned {
        tracing::debug!("live heart rate consumer went away");
        disable_heart_rate(&session).await;
    }
    session.release_stream(id);
}

/// Ping the device so it keeps measuring.
async fn keep_alive<T: Transport>(session: Session<T>) {
    const OPERATION: &str = "heart_rate_ping";
    let mut ticker = tokio::time::interval(session.timeouts().heart_rate_ping);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let link = match session.acquire(OPERATION).await {
            Ok(link) => link,
            Err(err) => {
                tracing::debug!(error = %err, "stopping heart rate keep-alive");
                return;
            }
        };
        let frame = session.table().frame(CommandId::HeartRatePing, &[]);
        let result = match frame {
            Ok(frame) => session.write(&link, &frame, OPERATION).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = session.settle(&link, result) {
            tracing::warn!(error = %err, "heart rate keep-alive failed");
            return;
        }
    }
}

/// Stop a live stream started by [`start_live_heart_rate`].
///
/// The stream ends locally first, so no sample arrives after this returns,
/// even when the device is unreachable. Stopping measurement on the
/// device is best effort. Unknown subscriptions are ignored.
#[tracing::instrument(skip(session))]
pub async fn stop_live_heart_rate<T: Transport>(session: &Session<T>, subscription: Subscription) {
    let Some(guard) = session.take_stream(subscription.0, StreamKind::LiveHeartRate) else {
        tracing::debug!("no such live stream");
        return;
    };
    guard.stop();
    tracing::info!("live heart rate stopped");
    disable_heart_rate(session).await;
}

/// Stop measurement on the device and drop the subscription, best effort.
async fn disable_heart_rate<T: Transport>(session: &Session<T>) {
    const OPERATION: &str = "stop_live_heart_rate";
    let link = match session.acquire(OPERATION).await {
        Ok(link) => link,
        Err(err) => {
            tracing::debug!(error = %err, "skipping device-side heart rate stop");
            return;
        }
    };
    match session.table().frame(CommandId::HeartRateContinuous, &[0]) {
        Ok(frame) => {
            if let Err(err) = session.write(&link, &frame, OPERATION).await {
                tracing::warn!(error = %err, "failed to stop heart rate measurement");
            }
        }
        Err(err) => tracing::warn!(error = %err, "cannot frame heart rate stop"),
    }
    if let Err(err) = session
        .unsubscribe(&link, Channel::HeartRateMeasurement, OPERATION)
        .await
    {
        tracing::warn!(error = %err, "failed to unsubscribe heart rate notifications");
    }
}

/// Stream every minute recorded since `since`.
///
/// Each minute yields one activity sample followed by one heart-rate sample,
/// both timestamped from the range start reported by the device. The command
/// lock is held until the transfer ends, so other commands queue behind it.
///
/// # Errors
///
/// Fails before streaming when the session is not authenticated, another
/// history transfer runs, or the range query fails. Failures during the
/// transfer (stall, link loss, malformed packet) end the stream with an `Err`.
#[tracing::instrument(skip(session), fields(since = %since))]
pub async fn fetch_stored_data<T: Transport>(
    session: &Session<T>,
    since: Timestamp,
) -> Result<SampleStream, BandError> {
    const OPERATION: &str = "fetch_stored_data";
    let link = session.acquire(OPERATION).await?;
    let end = Arc::new(StreamEnd::default());
    let id = session.register_stream(link.epoch(), StreamKind::History, Arc::clone(&end))?;

    let result = request_range(session, &link, since).await;
    let transfer = match session.settle(&link, result) {
        Ok(transfer) => transfer,
        Err(err) => {
            session.release_stream(id);
            if !err.is_link_lost() {
                unsubscribe_history(session, &link).await;
            }
            return Err(err);
        }
    };
    let Some(transfer) = transfer else {
        tracing::info!("no stored data since requested time");
        session.release_stream(id);
        unsubscribe_history(session, &link).await;
        return Ok(SampleStream::empty());
    };

    let (sender, receiver) = mpsc::channel(1);
    let task = tokio::spawn(receive_history(session.clone(), link, id, transfer, sender));
    session.attach_task(id, task.abort_handle());
    Ok(SampleStream::new(receiver, end, Subscription(id)))
}

struct Transfer {
    control: NotificationStream,
    data: NotificationStream,
    start: Timestamp,
    expected_bytes: u32,
}

/// Send the range query; `None` when the device has nothing to send.
async fn request_range<T: Transport>(
    session: &Session<T>,
    link: &Link<T::Connection>,
    since: Timestamp,
) -> Result<Option<Transfer>, BandError> {
    const OPERATION: &str = "fetch_stored_data";
    let table = session.table();
    let mut control = session
        .subscribe(link, Channel::FetchControl, OPERATION)
        .await?;
    let data = session
        .subscribe(link, Channel::ActivityData, OPERATION)
        .await?;

    let range = codec::encode_range_start(&time::to_local(since))?;
    session
        .write(link, &table.frame(CommandId::FetchStart, &range)?, OPERATION)
        .await?;
    let value = next_notification(
        session,
        &mut control,
        Channel::FetchControl,
        session.timeouts().command,
        OPERATION,
    )
    .await?;
    let response = codec::decode_response(table, "history metadata", &value)?;
    if response.status != table.status.success {
        return Err(ProtocolError::CommandFailed {
            command: CommandId::FetchStart.as_str(),
            status: response.status,
        }
        .into());
    }
    let metadata = codec::decode_history_metadata(&value)?;
    tracing::debug!(
        expected_bytes = metadata.expected_bytes,
        start = %metadata.start,
        "history metadata"
    );
    if metadata.expected_bytes == 0 {
        return Ok(None);
    }

    session
        .write(link, &table.frame(CommandId::FetchTransfer, &[])?, OPERATION)
        .await?;
    Ok(Some(Transfer {
        control,
        data,
        start: metadata.start,
        expected_bytes: metadata.expected_bytes,
    }))
}

async fn next_notification<T: Transport>(
    session: &Session<T>,
    notifications: &mut NotificationStream,
    channel: Channel,
    limit: std::time::Duration,
    operation: &'static str,
) -> Result<Vec<u8>, BandError> {
    let characteristic = session.table().uuid(channel)?;
    with_timeout(operation, limit, async {
        notifications
            .next()
            .await
            .ok_or_else(|| TransportError::StreamClosed { characteristic }.into())
    })
    .await
}

/// Decode packets until the end-of-range signal.
async fn receive_history<T: Transport>(
    session: Session<T>,
    link: Link<T::Connection>,
    id: u64,
    transfer: Transfer,
    sender: mpsc::Sender<SampleResult>,
) {
    let result = pump_history(&session, transfer, &sender).await;
    let result = session.settle_stream(id, &link, result);
    if !result.as_ref().is_err_and(|err| err.is_link_lost()) {
        unsubscribe_history(&session, &link).await;
    }
    drop(link);
    match result {
        Ok(minutes) => tracing::info!(minutes, "history transfer complete"),
        Err(err) => {
            let _ = sender.send(Err(err)).await;
        }
    }
    session.release_stream(id);
}

async fn unsubscribe_history<T: Transport>(session: &Session<T>, link: &Link<T::Connection>) {
    const OPERATION: &str = "fetch_stored_data";
    for channel in [Channel::ActivityData, Channel::FetchControl] {
        if let Err(err) = session.unsubscribe(link, channel, OPERATION).await {
            tracing::debug!(error = %err, %channel, "failed to unsubscribe history notifications");
        }
    }
}

async fn pump_history<T: Transport>(
    session: &Session<T>,
    mut transfer: Transfer,
    sender: &mpsc::Sender<SampleResult>,
) -> Result<u64, BandError> {
    const OPERATION: &str = "fetch_stored_data";
    let table = session.table();
    let stall = session.timeouts().fetch_stall;
    let finish = table.opcode(CommandId::FetchTransfer)?;
    let mut minutes: u64 = 0;
    let mut received: u64 = 0;

    loop {
        let next = with_timeout(OPERATION, stall, async {
            tokio::select! {
                biased;
                packet = transfer.data.next() => Ok(Packet::Data(packet)),
                control = transfer.control.next() => Ok(Packet::Control(control)),
            }
        })
        .await?;

        match next {
            Packet::Data(Some(bytes)) => {
                let (counter, samples) = codec::decode_activity_packet(table, &bytes)?;
                tracing::trace!(counter, samples = samples.len(), "history packet");
                received += u64::try_from(bytes.len().saturating_sub(1)).unwrap_or(u64::MAX);
                for raw in samples {
                    let timestamp = minute_timestamp(transfer.start, minutes)?;
                    minutes += 1;
                    let activity = TelemetrySample::Activity(ActivityRecord {
                        kind: ActivityKind(raw.kind),
                        intensity: raw.intensity,
                        steps: raw.steps,
                        timestamp,
                    });
                    let heart_rate =
                        TelemetrySample::heart_rate(u16::from(raw.heart_rate), timestamp);
                    for sample in [activity, heart_rate] {
                        if sender.send(Ok(sample)).await.is_err() {
                            tracing::debug!("history consumer went away");
                            return Ok(minutes);
                        }
                    }
                }
            }
            Packet::Control(Some(bytes)) => {
                let response = codec::decode_response(table, "history control", &bytes)?;
                if response.command != finish {
                    tracing::debug!(bytes = ?bytes, "ignoring history control notification");
                    continue;
                }
                if response.status != table.status.success {
                    return Err(ProtocolError::CommandFailed {
                        command: CommandId::FetchTransfer.as_str(),
                        status: response.status,
                    }
                    .into());
                }
                if received != u64::from(transfer.expected_bytes) {
                    tracing::warn!(
                        received,
                        expected = transfer.expected_bytes,
                        "history size differs from announced size"
                    );
                }
                return Ok(minutes);
            }
            Packet::Data(None) | Packet::Control(None) => {
                return Err(TransportError::StreamClosed {
                    characteristic: table.uuid(Channel::ActivityData)?,
                }
                .into());
            }
        }
    }
}

enum Packet {
    Data(Option<Vec<u8>>),
    Control(Option<Vec<u8>>),
}

fn minute_timestamp(start: Timestamp, minutes: u64) -> Result<Timestamp, BandError> {
    i64::try_from(minutes)
        .ok()
        .and_then(|m| start.checked_add_signed(MinuteStep::minutes(m)))
        .ok_or_else(|| {
            ProtocolError::InvalidField {
                field: "history minute",
                value: i64::try_from(minutes).unwrap_or(i64::MAX),
            }
            .into()
        })
}

/// Read clock, battery and revisions, all or nothing.
///
/// # Errors
///
/// Fails when the session is not authenticated or any read fails.
#[tracing::instrument(skip(session))]
pub async fn device_info<T: Transport>(session: &Session<T>) -> Result<DeviceInfo, BandError> {
    const OPERATION: &str = "device_info";
    let link = session.acquire(OPERATION).await?;
    let result = read_device_info(session, &link).await;
    session.settle(&link, result)
}

async fn read_device_info<T: Transport>(
    session: &Session<T>,
    link: &Link<T::Connection>,
) -> Result<DeviceInfo, BandError> {
    const OPERATION: &str = "device_info";
    let clock = codec::decode_device_time(&session.read(link, Channel::CurrentTime, OPERATION).await?)?;
    let battery = codec::decode_battery(&session.read(link, Channel::Battery, OPERATION).await?)?;
    let hardware_revision =
        codec::decode_revision(&session.read(link, Channel::HardwareRevision, OPERATION).await?);
    let firmware_revision =
        codec::decode_revision(&session.read(link, Channel::FirmwareRevision, OPERATION).await?);
    let address = session.address().ok_or(ConnectionError::NotConnected)?;
    Ok(DeviceInfo {
        address,
        battery,
        hardware_revision,
        firmware_revision,
        clock,
    })
}
