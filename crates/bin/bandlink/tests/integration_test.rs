//! End-to-end scenarios for the whole stack.
//!
//! Each test drives the `Band` facade against the virtual adapter, so the
//! real session, protocol table, codecs and simulated firmware all take part.
//! No radio is touched.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_stream::StreamExt;

use bandlink_adapter_virtual::{Faults, VirtualBand, VirtualTransport};
use bandlink_app::Band;
use bandlink_app::protocol::{Channel, MI_BAND_3};
use bandlink_app::services::session::Timeouts;
use bandlink_domain::configuration::ConfigStep;
use bandlink_domain::device::DeviceHandle;
use bandlink_domain::error::{AuthError, BandError, ConfigError, TransportError};
use bandlink_domain::key::AuthKey;
use bandlink_domain::profile::{Language, Sex, UserProfile};
use bandlink_domain::session::{FaultReason, SessionState};
use bandlink_domain::telemetry::TelemetrySample;

fn timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_secs(1),
        command: Duration::from_secs(1),
        pairing: Duration::from_secs(1),
        fetch_stall: Duration::from_millis(200),
        heart_rate_ping: Duration::from_secs(60),
    }
}

fn virtual_band() -> VirtualBand {
    VirtualBand {
        heart_rate_period: Duration::from_millis(20),
        ..VirtualBand::default()
    }
}

fn setup(faults: Faults) -> (VirtualTransport, Band<VirtualTransport>) {
    let transport = VirtualTransport::with_faults(virtual_band(), faults);
    let band = Band::with_timeouts(transport.clone(), timeouts());
    (transport, band)
}

fn profile() -> UserProfile {
    UserProfile::builder()
        .height_cm(175)
        .weight_kg(68.0)
        .date_of_birth(chrono::NaiveDate::from_ymd_opt(1988, 4, 9).unwrap())
        .sex(Sex::Female)
        .language(Language::French)
        .build()
        .unwrap()
}

/// Pair from scratch; returns the connected, authenticated facade.
async fn paired(faults: Faults) -> (VirtualTransport, Band<VirtualTransport>) {
    let (transport, band) = setup(faults);
    let address = virtual_band().address;
    band.connect(DeviceHandle::new(address)).await.unwrap();
    band.authenticate(true).await.unwrap();
    (transport, band)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_find_only_the_band_and_stop_scanning_once() {
    let (transport, band) = setup(Faults::default());

    let devices = band
        .search(Duration::from_millis(100))
        .await
        .unwrap()
        .collect_all()
        .await;

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address, virtual_band().address);
    assert_eq!(devices[0].name, "Mi Band 3");
    assert_eq!(transport.journal().await.stop_scans, 1);
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_pair_then_reauthenticate_with_persisted_key() {
    let (transport, band) = paired(Faults::default()).await;
    assert_eq!(band.state(), SessionState::Authenticated);
    let key = band.authentication_key().unwrap();
    assert_eq!(transport.paired_key().await, Some(key.clone()));

    let handle = band.disconnect().await.unwrap();
    assert_eq!(band.state(), SessionState::Disconnected);

    let again = Band::with_timeouts(transport.clone(), timeouts());
    again.connect(handle).await.unwrap();
    again.authenticate(false).await.unwrap();
    assert_eq!(again.state(), SessionState::Authenticated);
    assert_eq!(again.authentication_key(), Some(key));
}

#[tokio::test]
async fn should_report_mismatched_key() {
    let (_, band) = paired(Faults::default()).await;
    band.disconnect().await;

    let stranger = DeviceHandle::with_key(virtual_band().address, AuthKey::new([0x11; 16]));
    band.connect(stranger).await.unwrap();
    let err = band.authenticate(false).await.unwrap_err();

    assert!(matches!(err, BandError::Auth(AuthError::MismatchedKey)));
    assert!(matches!(band.state(), SessionState::Error(FaultReason::Authentication(_))));
}

#[tokio::test]
async fn should_surface_rejected_pairing() {
    let (_, band) = setup(Faults {
        reject_pairing: true,
        ..Faults::default()
    });
    band.connect(DeviceHandle::new(virtual_band().address))
        .await
        .unwrap();

    let err = band.authenticate(true).await.unwrap_err();

    assert!(matches!(err, BandError::Auth(AuthError::DeviceRejected { .. })));
    assert!(!band.state().is_authenticated());
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_push_settings_in_order_and_sync_clock() {
    let (transport, band) = paired(Faults::default()).await;
    let before = transport.journal().await.writes.len();

    band.configure(&profile(), 15).await.unwrap();

    let journal = transport.journal().await;
    let pushed = &journal.written()[before..];
    assert_eq!(pushed.len(), ConfigStep::SEQUENCE.len());
    let mut language = vec![0x06, 0x17, 0x00];
    language.extend_from_slice(b"fr_FR");
    assert_eq!(pushed[0], language);
    assert_eq!(pushed[8], vec![0x14, 15]);
    assert_eq!(pushed[9][..3], [0x4f, 0x00, 0x00]);
    assert_eq!(
        journal.unsubscribes.last(),
        Some(&MI_BAND_3.uuid(Channel::Auth).unwrap())
    );

    let drift = (transport.band().await.clock - Utc::now()).num_seconds().abs();
    assert!(drift <= 2, "band clock is {drift}s off");
    assert_eq!(band.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn should_encode_male_biometrics_as_final_step() {
    let (transport, band) = paired(Faults::default()).await;
    let before = transport.journal().await.writes.len();
    let profile = UserProfile::builder()
        .height_cm(180)
        .weight_kg(80.0)
        .date_of_birth(chrono::NaiveDate::from_ymd_opt(1974, 11, 21).unwrap())
        .sex(Sex::Male)
        .language(Language::English)
        .build()
        .unwrap();

    band.configure(&profile, 10).await.unwrap();

    let journal = transport.journal().await;
    let pushed = &journal.written()[before..];
    assert_eq!(pushed.len(), 10);
    // male is flag 0; weight in 1/200 kg
    assert_eq!(
        pushed[9],
        vec![0x4f, 0x00, 0x00, 0xb6, 0x07, 11, 21, 0, 180, 0, 0x80, 0x3e]
    );
}

#[tokio::test]
async fn should_name_the_step_that_failed() {
    let (transport, band) = paired(Faults::default()).await;
    transport
        .set_faults(Faults {
            fail_prefix: Some(vec![0x0a]),
            ..Faults::default()
        })
        .await;

    let err = band.configure(&profile(), 10).await.unwrap_err();

    let BandError::Config(ConfigError::Step { step, .. }) = err else {
        panic!("expected a step failure, got {err:?}");
    };
    assert_eq!(step, ConfigStep::Screens);
    assert_eq!(
        band.state(),
        SessionState::Error(FaultReason::Configuration {
            step: ConfigStep::Screens
        })
    );
}

#[tokio::test]
async fn should_refuse_configuration_before_authentication() {
    let (transport, band) = setup(Faults::default());
    band.connect(DeviceHandle::new(virtual_band().address))
        .await
        .unwrap();

    let err = band.configure(&profile(), 10).await.unwrap_err();

    assert!(matches!(err, BandError::NotAuthenticated { .. }));
    assert!(transport.journal().await.writes.is_empty());
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_read_device_info() {
    let (_, band) = paired(Faults::default()).await;

    let info = band.device_info().await.unwrap();

    assert_eq!(info.address, virtual_band().address);
    assert_eq!(info.battery.level, 87);
    assert!(!info.battery.charging);
    assert_eq!(info.hardware_revision, "V0.1.3.3");
    assert_eq!(info.firmware_revision, "V2.4.0.20");
}

#[tokio::test]
async fn should_fetch_history_since_requested_minute() {
    let (_, band) = paired(Faults::default()).await;
    let since = Utc.with_ymd_and_hms(2024, 3, 1, 8, 50, 0).unwrap();

    let samples: Vec<TelemetrySample> = band
        .stored_data(since)
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;

    assert_eq!(samples.len(), 2 * 10);
    let TelemetrySample::Activity(first) = &samples[0] else {
        panic!("expected an activity record first, got {:?}", samples[0]);
    };
    assert_eq!(first.timestamp, since);
    assert_eq!(first.steps, 50 % 7 * 10);
    // minute 59 was not worn
    assert_eq!(
        samples[19],
        TelemetrySample::HeartRate {
            bpm: None,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 59, 0).unwrap()
        }
    );
}

#[tokio::test]
async fn should_count_samples_handed_to_callback() {
    let (_, band) = paired(Faults::default()).await;
    let since = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

    let mut heart_rates = 0;
    let delivered = band
        .get_stored_data(since, |sample| {
            if matches!(sample, TelemetrySample::HeartRate { .. }) {
                heart_rates += 1;
            }
        })
        .await
        .unwrap();

    assert_eq!(delivered, 120);
    assert_eq!(heart_rates, 60);
}

#[tokio::test]
async fn should_end_empty_when_nothing_recorded_since() {
    let (_, band) = paired(Faults::default()).await;
    let since = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

    let delivered = band.get_stored_data(since, |_| {}).await.unwrap();

    assert_eq!(delivered, 0);
    assert_eq!(band.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn should_time_out_stalled_history() {
    let (_, band) = paired(Faults {
        stall_history: true,
        ..Faults::default()
    })
    .await;
    let since = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

    let mut samples = band.stored_data(since).await.unwrap();
    let item = samples.next().await.unwrap();

    assert!(matches!(item, Err(BandError::Timeout { .. })));
    assert!(samples.next().await.is_none());
    assert!(matches!(
        band.state(),
        SessionState::Error(FaultReason::Timeout { .. })
    ));
}

#[tokio::test]
async fn should_stream_live_heart_rate_until_stopped() {
    let (transport, band) = paired(Faults::default()).await;

    let mut samples = band.start_live_hr().await.unwrap();
    let mut bpms = Vec::new();
    for _ in 0..3 {
        match samples.next().await {
            Some(Ok(TelemetrySample::HeartRate { bpm, .. })) => bpms.push(bpm),
            other => panic!("unexpected live item {other:?}"),
        }
    }
    assert_eq!(bpms, vec![Some(72), Some(74), None]);

    let second = band.start_live_hr().await;
    assert!(matches!(second, Err(BandError::StreamActive { .. })));

    band.stop_live_hr(samples.subscription()).await;
    while let Some(item) = samples.next().await {
        assert!(item.is_ok());
    }
    let journal = transport.journal().await;
    assert_eq!(journal.written().last(), Some(&vec![0x15, 0x01, 0x00]));
    assert_eq!(band.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn should_close_live_stream_when_link_drops() {
    let (transport, band) = paired(Faults::default()).await;
    let mut samples = band.start_live_hr().await.unwrap();
    assert!(matches!(samples.next().await, Some(Ok(_))));

    transport.drop_link().await;

    let mut last = None;
    while let Some(item) = samples.next().await {
        last = Some(item);
    }
    assert!(matches!(
        last,
        Some(Err(BandError::Transport(TransportError::StreamClosed { .. })))
    ));
    assert_eq!(band.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn should_close_streams_on_disconnect() {
    let (_, band) = paired(Faults::default()).await;
    let mut samples = band.start_live_hr().await.unwrap();
    assert!(matches!(samples.next().await, Some(Ok(_))));

    band.disconnect().await;

    let mut errors = 0;
    while let Some(item) = samples.next().await {
        if item.is_err() {
            errors += 1;
        }
    }
    assert_eq!(errors, 1);
    assert!(!band.is_connected());
}
