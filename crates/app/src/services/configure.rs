//! Configuration: the ordered ten-step settings push.

use chrono::{DateTime, FixedOffset};

use bandlink_domain::configuration::ConfigStep;
use bandlink_domain::error::{BandError, ConfigError, ProtocolError};
use bandlink_domain::preferences::{DateFormat, DistanceUnit, Preferences, TimeFormat};
use bandlink_domain::profile::UserProfile;

use crate::ports::Transport;
use crate::protocol::codec;
use crate::protocol::{Channel, CommandId, Frame, ProtocolTable};
use crate::services::session::Session;

const OPERATION: &str = "configure";

/// The frames of one configuration run, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    steps: Vec<(ConfigStep, Frame)>,
}

impl Plan {
    #[must_use]
    pub fn steps(&self) -> &[(ConfigStep, Frame)] {
        &self.steps
    }
}

fn command(step: ConfigStep) -> CommandId {
    match step {
        ConfigStep::Language => CommandId::Language,
        ConfigStep::DateFormat => CommandId::DateFormat,
        ConfigStep::DistanceUnit => CommandId::DistanceUnit,
        ConfigStep::TimeFormat => CommandId::TimeFormat,
        ConfigStep::CurrentTime => CommandId::CurrentTime,
        ConfigStep::QuietHours => CommandId::QuietHours,
        ConfigStep::SleepHeartRate => CommandId::SleepHeartRate,
        ConfigStep::Screens => CommandId::Screens,
        ConfigStep::HeartRateInterval => CommandId::HeartRateInterval,
        ConfigStep::UserInfo => CommandId::UserInfo,
    }
}

fn payload(
    table: &ProtocolTable,
    step: ConfigStep,
    profile: &UserProfile,
    preferences: &Preferences,
    heart_rate_interval: u8,
    now: &DateTime<FixedOffset>,
) -> Result<Vec<u8>, ProtocolError> {
    Ok(match step {
        ConfigStep::Language => table.locale(profile.language)?.as_bytes().to_vec(),
        ConfigStep::DateFormat => {
            let formats = &table.date_formats;
            let pattern = match preferences.date_format {
                DateFormat::DayMonthYear => formats.day_month_year,
                DateFormat::MonthDayYear => formats.month_day_year,
                DateFormat::YearMonthDay => formats.year_month_day,
            };
            pattern.as_bytes().to_vec()
        }
        ConfigStep::DistanceUnit => vec![match preferences.distance_unit {
            DistanceUnit::Metric => 0,
            DistanceUnit::Imperial => 1,
        }],
        ConfigStep::TimeFormat => vec![match preferences.time_format {
            TimeFormat::TwentyFourHour => 1,
            TimeFormat::TwelveHour => 0,
        }],
        ConfigStep::CurrentTime => codec::encode_device_time(now)?.to_vec(),
        ConfigStep::QuietHours => codec::encode_quiet_hours(&preferences.quiet_hours).to_vec(),
        ConfigStep::SleepHeartRate => vec![u8::from(preferences.sleep_heart_rate)],
        ConfigStep::Screens => codec::encode_screens(table, &preferences.screens),
        ConfigStep::HeartRateInterval => vec![heart_rate_interval],
        ConfigStep::UserInfo => codec::encode_user_info(table, profile)?,
    })
}

/// Encode the whole sequence without touching the device.
///
/// `heart_rate_interval` is in minutes; zero turns periodic measurement off.
///
/// # Errors
///
/// Returns a [`ValidationError`](bandlink_domain::error::ValidationError) for
/// an invalid profile, or [`ConfigError::Step`] naming the step that could
/// not be encoded.
pub fn plan(
    table: &ProtocolTable,
    profile: &UserProfile,
    preferences: &Preferences,
    heart_rate_interval: u8,
    now: DateTime<FixedOffset>,
) -> Result<Plan, BandError> {
    profile.validate()?;
    let steps = ConfigStep::SEQUENCE
        .into_iter()
        .map(|step| {
            payload(table, step, profile, preferences, heart_rate_interval, &now)
                .and_then(|bytes| table.frame(command(step), &bytes))
                .map(|frame| (step, frame))
                .map_err(|err| ConfigError::Step {
                    step,
                    cause: Box::new(err.into()),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Plan { steps })
}

/// Write `plan` to the device, one step at a time.
///
/// The first failing step halts the run; steps before it stay applied.
///
/// # Errors
///
/// - [`BandError::NotAuthenticated`] before any write when not authenticated
/// - [`ConfigError::Step`] for the first step that failed
#[tracing::instrument(skip_all, fields(steps = plan.steps.len()))]
pub async fn apply<T: Transport>(session: &Session<T>, plan: &Plan) -> Result<(), BandError> {
    let link = session.acquire(OPERATION).await?;
    for (step, frame) in &plan.steps {
        tracing::debug!(%step, "configuring");
        if let Err(cause) = session.write(&link, frame, OPERATION).await {
            // link loss disconnects; anything else faults on this step
            if cause.is_link_lost() {
                session.fail(link.epoch(), &cause);
            }
            let err: BandError = ConfigError::Step {
                step: *step,
                cause: Box::new(cause),
            }
            .into();
            session.fail(link.epoch(), &err);
            tracing::warn!(%step, error = %err, "configuration stopped");
            return Err(err);
        }
    }
    if let Err(err) = session.unsubscribe(&link, Channel::Auth, OPERATION).await {
        tracing::warn!(error = %err, "failed to unsubscribe auth notifications");
    }
    tracing::info!("configuration applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{NaiveDate, NaiveTime, TimeZone};

    use super::*;
    use crate::protocol::MI_BAND_3;
    use crate::services::session::tests::{Call, Recorder, authenticated, handle, session};
    use bandlink_domain::preferences::{QuietHoursWindow, Screen, ScreenLayout};
    use bandlink_domain::profile::{Language, Sex};
    use bandlink_domain::session::{FaultReason, SessionState};

    fn profile() -> UserProfile {
        UserProfile::builder()
            .height_cm(180)
            .weight_kg(75.0)
            .date_of_birth(NaiveDate::from_ymd_opt(1990, 6, 15).unwrap())
            .sex(Sex::Male)
            .language(Language::English)
            .build()
            .unwrap()
    }

    fn now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 9, 15, 0)
            .unwrap()
    }

    fn default_plan() -> Plan {
        plan(&MI_BAND_3, &profile(), &Preferences::default(), 30, now()).unwrap()
    }

    #[test]
    fn should_plan_ten_steps_in_order() {
        let plan = default_plan();
        let order: Vec<ConfigStep> = plan.steps().iter().map(|(step, _)| *step).collect();
        assert_eq!(order, ConfigStep::SEQUENCE.to_vec());
    }

    #[test]
    fn should_encode_default_preferences() {
        let plan = default_plan();
        let bytes = |step: ConfigStep| {
            plan.steps()
                .iter()
                .find(|(s, _)| *s == step)
                .map(|(_, frame)| frame.bytes.clone())
                .unwrap()
        };
        let mut language = vec![0x06, 0x17, 0x00];
        language.extend_from_slice(b"en_US");
        assert_eq!(bytes(ConfigStep::Language), language);
        let mut date = vec![0x06, 0x1e, 0x00];
        date.extend_from_slice(b"dd/MM/yyyy");
        assert_eq!(bytes(ConfigStep::DateFormat), date);
        assert_eq!(bytes(ConfigStep::DistanceUnit), vec![0x06, 0x03, 0x00, 0x00]);
        assert_eq!(bytes(ConfigStep::TimeFormat), vec![0x06, 0x02, 0x00, 0x01]);
        assert_eq!(
            bytes(ConfigStep::CurrentTime),
            vec![0xe8, 0x07, 3, 1, 9, 15, 0, 5, 0, 0, 4]
        );
        assert_eq!(bytes(ConfigStep::QuietHours), vec![0x1a, 0x01, 22, 0, 8, 0]);
        assert_eq!(bytes(ConfigStep::SleepHeartRate), vec![0x15, 0x00, 0x01]);
        assert_eq!(bytes(ConfigStep::HeartRateInterval), vec![0x14, 30]);
        assert_eq!(
            bytes(ConfigStep::UserInfo),
            vec![0x4f, 0x00, 0x00, 0xc6, 0x07, 6, 15, 0, 180, 0, 0x98, 0x3a]
        );
    }

    #[test]
    fn should_frame_screen_layout_and_channels() {
        let prefs = Preferences {
            screens: ScreenLayout::new(vec![Screen::HeartRate, Screen::Timer]).unwrap(),
            quiet_hours: QuietHoursWindow::new(
                NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
                NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            )
            .unwrap(),
            ..Preferences::default()
        };
        let plan = plan(&MI_BAND_3, &profile(), &prefs, 0, now()).unwrap();
        let (_, screens) = &plan.steps()[7];
        assert_eq!(screens.channel, Channel::Configuration);
        assert_eq!(screens.bytes[0], 0x0a);
        assert_eq!(screens.bytes[1], 0x01 | 0x40 | 0x80);
        let (_, clock) = &plan.steps()[4];
        assert_eq!(clock.channel, Channel::CurrentTime);
        let (_, user) = &plan.steps()[9];
        assert_eq!(user.channel, Channel::UserSettings);
        let (_, quiet) = &plan.steps()[5];
        assert_eq!(quiet.bytes, vec![0x1a, 0x01, 23, 30, 7, 0]);
    }

    #[test]
    fn should_reject_invalid_profile_before_encoding() {
        let mut profile = profile();
        profile.height_cm = 10;
        let err = plan(&MI_BAND_3, &profile, &Preferences::default(), 10, now()).unwrap_err();
        assert!(matches!(err, BandError::Validation(_)));
    }

    #[tokio::test]
    async fn should_write_every_step_then_unsubscribe_auth() {
        let recorder = Arc::new(Recorder::default());
        let session = authenticated(&recorder).await;
        let plan = default_plan();

        apply(&session, &plan).await.unwrap();

        let expected: Vec<Vec<u8>> = plan.steps().iter().map(|(_, f)| f.bytes.clone()).collect();
        assert_eq!(recorder.writes(), expected);
        assert_eq!(
            recorder.calls().last(),
            Some(&Call::Unsubscribe(MI_BAND_3.uuid(Channel::Auth).unwrap()))
        );
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn should_halt_on_failed_step() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail_write.lock().unwrap() = Some(7);
        let session = authenticated(&recorder).await;

        let err = apply(&session, &default_plan()).await.unwrap_err();

        let BandError::Config(config) = &err else {
            panic!("expected a configuration error, got {err:?}");
        };
        assert_eq!(config.step(), ConfigStep::Screens);
        assert_eq!(recorder.writes().len(), 8);
        assert_eq!(
            session.state(),
            SessionState::Error(FaultReason::Configuration {
                step: ConfigStep::Screens
            })
        );
        let again = apply(&session, &default_plan()).await.unwrap_err();
        assert!(matches!(again, BandError::NotAuthenticated { .. }));
    }

    #[tokio::test]
    async fn should_refuse_configuration_before_authentication() {
        let recorder = Arc::new(Recorder::default());
        let session = session(&recorder);
        session.connect(handle()).await.unwrap();

        let err = apply(&session, &default_plan()).await.unwrap_err();

        assert!(matches!(err, BandError::NotAuthenticated { .. }));
        assert!(recorder.writes().is_empty());
    }
}
