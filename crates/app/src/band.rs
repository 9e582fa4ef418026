//! Band facade: the caller-facing API for one tracker.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use bandlink_domain::device::{DeviceHandle, DeviceInfo};
use bandlink_domain::error::BandError;
use bandlink_domain::key::AuthKey;
use bandlink_domain::preferences::Preferences;
use bandlink_domain::profile::UserProfile;
use bandlink_domain::session::SessionState;
use bandlink_domain::telemetry::TelemetrySample;
use bandlink_domain::time::{self, Timestamp};

use crate::ports::Transport;
use crate::services::discovery::{self, Discovery, SearchOptions};
use crate::services::session::{Session, Timeouts};
use crate::services::telemetry::{SampleStream, Subscription};
use crate::services::{auth, cipher, configure, telemetry};

/// One tracker, driven over transport `T`.
///
/// Cheap to clone; clones drive the same session.
pub struct Band<T: Transport> {
    session: Session<T>,
    name: String,
}

impl<T: Transport> Clone for Band<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            name: self.name.clone(),
        }
    }
}

impl<T: Transport> Band<T> {
    /// Facade with default timeouts, matching the stock advertised name.
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, Timeouts::default())
    }

    pub fn with_timeouts(transport: T, timeouts: Timeouts) -> Self {
        Self::from_session(Session::new(Arc::new(transport), timeouts))
    }

    /// Facade over an existing session.
    pub fn from_session(session: Session<T>) -> Self {
        let name = session.table().advertised_name.to_owned();
        Self { session, name }
    }

    /// Match another advertised name during [`Band::search`].
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Scan for trackers for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a discovery error when the radio cannot scan.
    pub async fn search(&self, timeout: Duration) -> Result<Discovery, BandError> {
        let options = SearchOptions {
            name: self.name.clone(),
            timeout,
        };
        discovery::search(Arc::clone(self.session.transport()), options).await
    }

    /// Connect to `handle`'s device, generating a key if it has none.
    ///
    /// Read a generated key back with [`Band::authentication_key`] and keep
    /// it, or the next session will need a full pairing again.
    ///
    /// # Errors
    ///
    /// See [`Session::connect`].
    pub async fn connect(&self, mut handle: DeviceHandle) -> Result<(), BandError> {
        if handle.key().is_none() {
            tracing::info!(address = %handle.address(), "no key on handle, generating one");
            handle.set_key(cipher::generate_key());
        }
        self.session.connect(handle).await
    }

    /// Tear down the link and return the device handle, key included.
    pub async fn disconnect(&self) -> Option<DeviceHandle> {
        self.session.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn authentication_key(&self) -> Option<AuthKey> {
        self.session.authentication_key()
    }

    /// Run the handshake; see [`auth::authenticate`].
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`](bandlink_domain::error::AuthError) or a
    /// transport failure.
    pub async fn authenticate(&self, full: bool) -> Result<(), BandError> {
        auth::authenticate(&self.session, full).await
    }

    /// Push `profile` with default preferences.
    ///
    /// # Errors
    ///
    /// See [`Band::configure_with`].
    pub async fn configure(
        &self,
        profile: &UserProfile,
        heart_rate_interval: u8,
    ) -> Result<(), BandError> {
        self.configure_with(profile, &Preferences::default(), heart_rate_interval)
            .await
    }

    /// Push `profile` and `preferences`, syncing the clock to the host.
    ///
    /// # Errors
    ///
    /// - [`BandError::NotAuthenticated`] unless authenticated
    /// - [`BandError::Validation`] for an invalid profile
    /// - [`ConfigError::Step`](bandlink_domain::error::ConfigError) for the
    ///   first step that failed
    pub async fn configure_with(
        &self,
        profile: &UserProfile,
        preferences: &Preferences,
        heart_rate_interval: u8,
    ) -> Result<(), BandError> {
        let state = self.session.state();
        if !state.is_authenticated() {
            return Err(BandError::NotAuthenticated {
                operation: "configure",
                state,
            });
        }
        let plan = configure::plan(
            self.session.table(),
            profile,
            preferences,
            heart_rate_interval,
            time::local_now(),
        )?;
        configure::apply(&self.session, &plan).await
    }

    /// # Errors
    ///
    /// See [`telemetry::device_info`].
    pub async fn device_info(&self) -> Result<DeviceInfo, BandError> {
        telemetry::device_info(&self.session).await
    }

    /// Stream every recorded minute since `since`.
    ///
    /// # Errors
    ///
    /// See [`telemetry::fetch_stored_data`].
    pub async fn stored_data(&self, since: Timestamp) -> Result<SampleStream, BandError> {
        telemetry::fetch_stored_data(&self.session, since).await
    }

    /// Hand every recorded sample since `since` to `on_sample`, as it arrives.
    ///
    /// Returns the number of samples delivered once the device signals the
    /// end of the range.
    ///
    /// # Errors
    ///
    /// Fails like [`Band::stored_data`], or with the error that ended the
    /// transfer; samples delivered before it are not taken back.
    pub async fn get_stored_data<F>(&self, since: Timestamp, mut on_sample: F) -> Result<usize, BandError>
    where
        F: FnMut(TelemetrySample),
    {
        let mut stream = self.stored_data(since).await?;
        let mut delivered = 0;
        while let Some(sample) = stream.next().await {
            on_sample(sample?);
            delivered += 1;
        }
        Ok(delivered)
    }

    /// # Errors
    ///
    /// See [`telemetry::start_live_heart_rate`].
    pub async fn start_live_hr(&self) -> Result<SampleStream, BandError> {
        telemetry::start_live_heart_rate(&self.session).await
    }

    pub async fn stop_live_hr(&self, subscription: Subscription) {
        telemetry::stop_live_heart_rate(&self.session, subscription).await;
    }
}
