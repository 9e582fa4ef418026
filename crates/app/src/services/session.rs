//! Session state machine: gatekeeper for every device operation.
//!
//! A [`Session`] owns the link to one tracker and the [`DeviceHandle`] that
//! goes with it. Operations ask it for a [`Link`], which carries the command
//! lock, so at most one command is in flight per session. Every link is
//! stamped with the session epoch; `disconnect` bumps the epoch, so results of
//! operations that were in flight at the time are discarded rather than
//! applied to the next connection.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::task::AbortHandle;

use bandlink_domain::address::DeviceAddress;
use bandlink_domain::device::DeviceHandle;
use bandlink_domain::error::{AuthError, BandError, ConnectionError};
use bandlink_domain::key::AuthKey;
use bandlink_domain::session::{FaultReason, SessionState};

use crate::ports::{NotificationStream, Transport};
use crate::protocol::{Channel, Frame, MI_BAND_3, ProtocolTable};

/// Time limits applied to every device exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    /// Each write, read, or awaited response.
    pub command: Duration,
    /// Key exchange waits for the wearer to tap the band.
    pub pairing: Duration,
    /// Longest gap between two history packets.
    pub fetch_stall: Duration,
    /// Period of the live heart-rate keep-alive.
    pub heart_rate_ping: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            command: Duration::from_secs(5),
            pairing: Duration::from_secs(30),
            fetch_stall: Duration::from_secs(10),
            heart_rate_ping: Duration::from_secs(12),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn millis(limit: Duration) -> u64 {
    limit.as_millis() as u64
}

/// Run `future`, failing with [`BandError::Timeout`] after `limit`.
pub(crate) async fn with_timeout<R, F>(
    operation: &'static str,
    limit: Duration,
    future: F,
) -> Result<R, BandError>
where
    F: Future<Output = Result<R, BandError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(BandError::Timeout {
            operation,
            timeout_ms: millis(limit),
        }),
    }
}

/// Kinds of long-running deliveries a session can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    LiveHeartRate,
    History,
}

impl StreamKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::LiveHeartRate => "live heart rate",
            Self::History => "history",
        }
    }
}

/// How a sample stream was ended from outside its own tasks.
#[derive(Debug, Default)]
pub(crate) struct StreamEnd(AtomicU8);

impl StreamEnd {
    const OPEN: u8 = 0;
    const STOPPED: u8 = 1;
    const CLOSED: u8 = 2;
    const LOST: u8 = 3;
    const FAULTED: u8 = 4;

    fn close(&self) {
        self.0.store(Self::CLOSED, Ordering::Release);
    }

    fn interrupt(&self, link_lost: bool) {
        let code = if link_lost { Self::LOST } else { Self::FAULTED };
        self.0.store(code, Ordering::Release);
    }

    fn stop(&self) {
        let _ = self.0.compare_exchange(
            Self::OPEN,
            Self::STOPPED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The caller stopped the stream.
    pub(crate) fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire) == Self::STOPPED
    }

    /// The error a stream ended from outside reports, if any.
    pub(crate) fn failure(&self) -> Option<ConnectionError> {
        match self.0.load(Ordering::Acquire) {
            Self::CLOSED => Some(ConnectionError::Closed),
            Self::LOST => Some(ConnectionError::Dropped),
            Self::FAULTED => Some(ConnectionError::Interrupted),
            _ => None,
        }
    }
}

/// Background tasks feeding one sample stream.
pub(crate) struct StreamGuard {
    kind: StreamKind,
    end: Arc<StreamEnd>,
    tasks: Vec<AbortHandle>,
}

impl StreamGuard {
    /// Mark the stream closed so no further sample reaches the consumer,
    /// then stop its tasks.
    pub(crate) fn cancel(self) {
        self.end.close();
        self.abort();
    }

    /// End the stream because another exchange failed.
    fn interrupt(self, link_lost: bool) {
        self.end.interrupt(link_lost);
        self.abort();
    }

    /// End the stream without an error.
    pub(crate) fn stop(self) {
        self.end.stop();
        self.abort();
    }

    fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Exclusive right to talk to the device, for one epoch.
pub struct Link<C> {
    connection: C,
    epoch: u64,
    _permit: OwnedMutexGuard<()>,
}

impl<C> Link<C> {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

struct Inner<C> {
    state: SessionState,
    epoch: u64,
    handle: Option<DeviceHandle>,
    connection: Option<C>,
    streams: HashMap<u64, StreamGuard>,
    next_stream: u64,
}

impl<C> Inner<C> {
    fn drain_streams(&mut self) -> Vec<StreamGuard> {
        self.streams.drain().map(|(_, guard)| guard).collect()
    }

    fn drain_streams_except(&mut self, keep: Option<u64>) -> Vec<StreamGuard> {
        let doomed: Vec<u64> = self
            .streams
            .keys()
            .copied()
            .filter(|id| Some(*id) != keep)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.streams.remove(&id))
            .collect()
    }
}

struct Shared<C> {
    inner: Mutex<Inner<C>>,
    command_lock: Arc<tokio::sync::Mutex<()>>,
}

/// The link to one tracker and everything that gates its use.
///
/// Cheap to clone; clones share state.
pub struct Session<T: Transport> {
    transport: Arc<T>,
    shared: Arc<Shared<T::Connection>>,
    table: &'static ProtocolTable,
    timeouts: Timeouts,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            shared: Arc::clone(&self.shared),
            table: self.table,
            timeouts: self.timeouts,
        }
    }
}

impl<T: Transport> Session<T> {
    /// Session speaking the Mi Band 3 protocol over `transport`.
    pub fn new(transport: Arc<T>, timeouts: Timeouts) -> Self {
        Self::with_table(transport, &MI_BAND_3, timeouts)
    }

    /// Session speaking another protocol revision.
    pub fn with_table(
        transport: Arc<T>,
        table: &'static ProtocolTable,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            transport,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Disconnected,
                    epoch: 0,
                    handle: None,
                    connection: None,
                    streams: HashMap::new(),
                    next_stream: 0,
                }),
                command_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
            table,
            timeouts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T::Connection>> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn table(&self) -> &'static ProtocolTable {
        self.table
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().state.has_link()
    }

    /// Copy of the key held by the current device handle.
    pub fn authentication_key(&self) -> Option<AuthKey> {
        self.lock().handle.as_ref().and_then(|h| h.key().cloned())
    }

    /// Address of the current device handle.
    pub fn address(&self) -> Option<DeviceAddress> {
        self.lock().handle.as_ref().map(DeviceHandle::address)
    }

    /// Open the link to `handle`'s device.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::InvalidState`] unless the session is `Disconnected`
    /// - [`BandError::Timeout`] when the link is not up within the connect timeout
    /// - [`ConnectionError::Aborted`] when `disconnect` ran meanwhile
    /// - whatever the transport reports for a refused link
    #[tracing::instrument(skip(self, handle), fields(address = %handle.address()))]
    pub async fn connect(&self, handle: DeviceHandle) -> Result<(), BandError> {
        let address = handle.address();
        let (epoch, leftovers) = {
            let mut inner = self.lock();
            if inner.state != SessionState::Disconnected {
                return Err(ConnectionError::InvalidState {
                    operation: "connect",
                    state: inner.state.clone(),
                }
                .into());
            }
            inner.state = SessionState::Connecting;
            inner.handle = Some(handle);
            (inner.epoch, inner.drain_streams())
        };
        for guard in leftovers {
            guard.cancel();
        }

        let outcome = with_timeout(
            "connect",
            self.timeouts.connect,
            self.transport.connect(address),
        )
        .await;

        let superseded = {
            let mut inner = self.lock();
            if inner.epoch == epoch {
                match &outcome {
                    Ok(connection) => {
                        inner.connection = Some(connection.clone());
                        inner.state = SessionState::Connected;
                    }
                    Err(err) if err.is_timeout() => {
                        inner.state = SessionState::Error(FaultReason::from(err));
                    }
                    Err(_) => inner.state = SessionState::Disconnected,
                }
                false
            } else {
                true
            }
        };

        if superseded {
            if let Ok(connection) = &outcome {
                if let Err(err) = self.transport.disconnect(connection).await {
                    tracing::warn!(error = %err, "failed to close superseded link");
                }
            }
            return Err(ConnectionError::Aborted {
                operation: "connect",
            }
            .into());
        }
        match outcome {
            Ok(_) => {
                tracing::info!("connected");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "connection failed");
                Err(err)
            }
        }
    }

    /// Tear everything down and hand the device handle back.
    ///
    /// Never fails and never waits for in-flight commands: their results are
    /// discarded. Every stream of the session is closed before this returns.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) -> Option<DeviceHandle> {
        let (connection, handle, streams) = {
            let mut inner = self.lock();
            inner.epoch += 1;
            inner.state = SessionState::Disconnected;
            (
                inner.connection.take(),
                inner.handle.take(),
                inner.drain_streams(),
            )
        };
        for guard in streams {
            guard.cancel();
        }
        if let Some(connection) = connection {
            let closing = with_timeout(
                "disconnect",
                self.timeouts.command,
                self.transport.disconnect(&connection),
            );
            if let Err(err) = closing.await {
                tracing::warn!(error = %err, "transport disconnect failed");
            }
        }
        tracing::info!("disconnected");
        handle
    }

    /// Enter `Authenticating` and take the command lock.
    ///
    /// Legal from `Connected` and `Authenticated` (re-authentication).
    pub(crate) async fn begin_authentication(
        &self,
    ) -> Result<(Link<T::Connection>, AuthKey), BandError> {
        let epoch = {
            let inner = self.lock();
            if !matches!(
                inner.state,
                SessionState::Connected | SessionState::Authenticated
            ) {
                return Err(ConnectionError::InvalidState {
                    operation: "authenticate",
                    state: inner.state.clone(),
                }
                .into());
            }
            inner.epoch
        };
        let permit = Arc::clone(&self.shared.command_lock).lock_owned().await;

        let mut inner = self.lock();
        if inner.epoch != epoch {
            return Err(ConnectionError::Aborted {
                operation: "authenticate",
            }
            .into());
        }
        // the command we queued behind may have faulted the session
        if !matches!(
            inner.state,
            SessionState::Connected | SessionState::Authenticated
        ) {
            return Err(ConnectionError::InvalidState {
                operation: "authenticate",
                state: inner.state.clone(),
            }
            .into());
        }
        let key = inner
            .handle
            .as_ref()
            .and_then(|h| h.key().cloned())
            .ok_or(AuthError::MissingKey)?;
        let connection = inner
            .connection
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        inner.state = SessionState::Authenticating;
        Ok((
            Link {
                connection,
                epoch,
                _permit: permit,
            },
            key,
        ))
    }

    /// Leave `Authenticating` with the handshake outcome.
    pub(crate) fn finish_authentication(
        &self,
        link: &Link<T::Connection>,
        result: Result<(), BandError>,
    ) -> Result<(), BandError> {
        match result {
            Ok(()) => {
                let mut inner = self.lock();
                if inner.epoch != link.epoch {
                    return Err(ConnectionError::Aborted {
                        operation: "authenticate",
                    }
                    .into());
                }
                inner.state = SessionState::Authenticated;
                tracing::info!("authenticated");
                Ok(())
            }
            Err(err) => {
                self.fail(link.epoch, &err);
                Err(err)
            }
        }
    }

    /// Take the command lock for a guarded operation.
    ///
    /// # Errors
    ///
    /// Returns [`BandError::NotAuthenticated`] without touching the device
    /// unless the session is `Authenticated`.
    pub(crate) async fn acquire(
        &self,
        operation: &'static str,
    ) -> Result<Link<T::Connection>, BandError> {
        let epoch = {
            let inner = self.lock();
            if !inner.state.is_authenticated() {
                return Err(BandError::NotAuthenticated {
                    operation,
                    state: inner.state.clone(),
                });
            }
            inner.epoch
        };
        let permit = Arc::clone(&self.shared.command_lock).lock_owned().await;

        let inner = self.lock();
        if inner.epoch != epoch {
            return Err(ConnectionError::Aborted { operation }.into());
        }
        if !inner.state.is_authenticated() {
            return Err(BandError::NotAuthenticated {
                operation,
                state: inner.state.clone(),
            });
        }
        let connection = inner
            .connection
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        Ok(Link {
            connection,
            epoch,
            _permit: permit,
        })
    }

    /// Record a failed exchange.
    ///
    /// Link loss moves the session to `Disconnected`, anything else to
    /// `Error`. Either way every running stream ends with an `Err`.
    /// Failures from a previous epoch are ignored.
    pub(crate) fn fail(&self, epoch: u64, err: &BandError) {
        self.fault(epoch, err, None);
    }

    /// Record a failure raised by stream `id` itself.
    ///
    /// That stream stays registered so it can report `err` to its consumer;
    /// every other stream is ended as by [`Session::fail`].
    pub(crate) fn fail_stream(&self, id: u64, epoch: u64, err: &BandError) {
        self.fault(epoch, err, Some(id));
    }

    fn fault(&self, epoch: u64, err: &BandError, keep: Option<u64>) {
        let link_lost = err.is_link_lost();
        let streams = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                tracing::debug!(error = %err, "ignoring failure from a previous connection");
                return;
            }
            if link_lost {
                inner.epoch += 1;
                inner.connection = None;
                inner.state = SessionState::Disconnected;
                tracing::warn!(error = %err, "link lost");
            } else {
                inner.state = SessionState::Error(FaultReason::from(err));
                tracing::warn!(error = %err, state = %inner.state, "session faulted");
            }
            inner.drain_streams_except(keep)
        };
        for guard in streams {
            tracing::debug!(kind = guard.kind.as_str(), "ending stream after failure");
            guard.interrupt(link_lost);
        }
    }

    /// [`Session::settle`] for the task feeding stream `id`.
    pub(crate) fn settle_stream<R>(
        &self,
        id: u64,
        link: &Link<T::Connection>,
        result: Result<R, BandError>,
    ) -> Result<R, BandError> {
        if let Err(err) = &result {
            self.fail_stream(id, link.epoch, err);
        }
        result
    }

    /// Pass `result` through, recording a failure against `link`'s epoch.
    pub(crate) fn settle<R>(
        &self,
        link: &Link<T::Connection>,
        result: Result<R, BandError>,
    ) -> Result<R, BandError> {
        if let Err(err) = &result {
            self.fail(link.epoch, err);
        }
        result
    }

    pub(crate) async fn write(
        &self,
        link: &Link<T::Connection>,
        frame: &Frame,
        operation: &'static str,
    ) -> Result<(), BandError> {
        let uuid = self.table.uuid(frame.channel)?;
        tracing::trace!(channel = %frame.channel, bytes = ?frame.bytes, "write");
        with_timeout(
            operation,
            self.timeouts.command,
            self.transport.write(&link.connection, uuid, &frame.bytes),
        )
        .await
    }

    pub(crate) async fn read(
        &self,
        link: &Link<T::Connection>,
        channel: Channel,
        operation: &'static str,
    ) -> Result<Vec<u8>, BandError> {
        let uuid = self.table.uuid(channel)?;
        let value = with_timeout(
            operation,
            self.timeouts.command,
            self.transport.read(&link.connection, uuid),
        )
        .await?;
        tracing::trace!(%channel, bytes = ?value, "read");
        Ok(value)
    }

    pub(crate) async fn subscribe(
        &self,
        link: &Link<T::Connection>,
        channel: Channel,
        operation: &'static str,
    ) -> Result<NotificationStream, BandError> {
        let uuid = self.table.uuid(channel)?;
        with_timeout(
            operation,
            self.timeouts.command,
            self.transport.subscribe(&link.connection, uuid),
        )
        .await
    }

    pub(crate) async fn unsubscribe(
        &self,
        link: &Link<T::Connection>,
        channel: Channel,
        operation: &'static str,
    ) -> Result<(), BandError> {
        let uuid = self.table.uuid(channel)?;
        with_timeout(
            operation,
            self.timeouts.command,
            self.transport.unsubscribe(&link.connection, uuid),
        )
        .await
    }

    /// Whether a stream of `kind` is running.
    pub(crate) fn has_stream(&self, kind: StreamKind) -> bool {
        self.lock().streams.values().any(|g| g.kind == kind)
    }

    /// Reserve a stream slot for `epoch`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Aborted`] if the session moved on, or
    /// [`BandError::StreamActive`] when a stream of `kind` already runs.
    pub(crate) fn register_stream(
        &self,
        epoch: u64,
        kind: StreamKind,
        end: Arc<StreamEnd>,
    ) -> Result<u64, BandError> {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return Err(ConnectionError::Aborted {
                operation: kind.as_str(),
            }
            .into());
        }
        if inner.streams.values().any(|g| g.kind == kind) {
            return Err(BandError::StreamActive {
                kind: kind.as_str(),
            });
        }
        let id = inner.next_stream;
        inner.next_stream += 1;
        inner.streams.insert(
            id,
            StreamGuard {
                kind,
                end,
                tasks: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Tie a task to stream `id`; aborts it at once if the stream is gone.
    pub(crate) fn attach_task(&self, id: u64, task: AbortHandle) {
        let mut inner = self.lock();
        match inner.streams.get_mut(&id) {
            Some(guard) => guard.tasks.push(task),
            None => task.abort(),
        }
    }

    /// Forget stream `id` after it ended on its own, stopping its other tasks.
    pub(crate) fn release_stream(&self, id: u64) {
        let guard = self.lock().streams.remove(&id);
        if let Some(guard) = guard {
            guard.abort();
        }
    }

    /// Detach stream `id` if it is of `kind`.
    pub(crate) fn take_stream(&self, id: u64, kind: StreamKind) -> Option<StreamGuard> {
        let mut inner = self.lock();
        if inner.streams.get(&id).is_some_and(|g| g.kind == kind) {
            inner.streams.remove(&id)
        } else {
            None
        }
    }
}
