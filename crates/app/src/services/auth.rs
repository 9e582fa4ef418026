//! Pairing and challenge-response handshake.

use tokio_stream::StreamExt;

use bandlink_domain::error::{AuthError, BandError, TransportError};
use bandlink_domain::key::AuthKey;

use crate::ports::{NotificationStream, Transport};
use crate::protocol::codec::{self, CHALLENGE_LEN};
use crate::protocol::{Channel, CommandId};
use crate::services::cipher;
use crate::services::session::{Link, Session};

const OPERATION: &str = "authenticate";

/// Run the handshake and move the session to `Authenticated`.
///
/// With `full`, the key is sent first and the wearer must confirm pairing on
/// the band; otherwise the device is expected to already hold the key.
///
/// # Errors
///
/// - [`AuthError::MismatchedKey`] when the device answers the challenge
///   response with the key-mismatch status
/// - [`AuthError::DeviceRejected`] for any other failure status
/// - [`AuthError::Timeout`] when a step goes unanswered
///
/// On failure the session moves to `Error` (or `Disconnected` on link loss).
#[tracing::instrument(skip(session))]
pub async fn authenticate<T: Transport>(session: &Session<T>, full: bool) -> Result<(), BandError> {
    let (link, key) = session.begin_authentication().await?;
    let result = handshake(session, &link, &key, full).await;
    session.finish_authentication(&link, result)
}

async fn handshake<T: Transport>(
    session: &Session<T>,
    link: &Link<T::Connection>,
    key: &AuthKey,
    full: bool,
) -> Result<(), BandError> {
    let table = session.table();
    let timeouts = session.timeouts();
    let mut notifications = session.subscribe(link, Channel::Auth, OPERATION).await?;

    if full {
        tracing::debug!("sending key, waiting for the wearer to confirm");
        let frame = table.frame(CommandId::AuthSendKey, key.as_bytes())?;
        session.write(link, &frame, OPERATION).await?;
        expect_success(session, &mut notifications, CommandId::AuthSendKey, timeouts.pairing)
            .await?;
    }

    tracing::debug!("requesting challenge");
    let frame = table.frame(CommandId::AuthRequestChallenge, &[])?;
    session.write(link, &frame, OPERATION).await?;
    let payload = expect_success(
        session,
        &mut notifications,
        CommandId::AuthRequestChallenge,
        timeouts.command,
    )
    .await?;
    let challenge: [u8; CHALLENGE_LEN] = payload
        .get(..CHALLENGE_LEN)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(AuthError::UnexpectedResponse {
            step: table.opcode(CommandId::AuthRequestChallenge)?,
        })?;

    tracing::debug!("answering challenge");
    let response = cipher::respond(key, &challenge);
    let frame = table.frame(CommandId::AuthSendResponse, &response)?;
    session.write(link, &frame, OPERATION).await?;
    expect_success(
        session,
        &mut notifications,
        CommandId::AuthSendResponse,
        timeouts.command,
    )
    .await?;
    Ok(())
}

/// Wait for the response to `command`, returning its payload.
async fn expect_success<T: Transport>(
    session: &Session<T>,
    notifications: &mut NotificationStream,
    command: CommandId,
    limit: std::time::Duration,
) -> Result<Vec<u8>, BandError> {
    let table = session.table();
    let step = table.opcode(command)?;
    let value = match tokio::time::timeout(limit, notifications.next()).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            return Err(TransportError::StreamClosed {
                characteristic: table.uuid(Channel::Auth)?,
            }
            .into());
        }
        Err(_) => return Err(AuthError::Timeout.into()),
    };
    tracing::trace!(bytes = ?value, "auth notification");
    let response = codec::decode_response(table, "auth", &value)?;
    if response.command != step {
        return Err(AuthError::UnexpectedResponse { step }.into());
    }
    if response.status == table.status.success {
        return Ok(response.payload.to_vec());
    }
    if command == CommandId::AuthSendResponse && response.status == table.status.mismatched_key {
        return Err(AuthError::MismatchedKey.into());
    }
    Err(AuthError::DeviceRejected {
        step,
        status: response.status,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::MI_BAND_3;
    use crate::services::session::tests::{Recorder, handle, session};
    use bandlink_domain::session::{FaultReason, SessionState};

    fn auth_uuid() -> uuid::Uuid {
        MI_BAND_3.uuid(Channel::Auth).unwrap()
    }

    fn challenge_reply() -> Vec<u8> {
        let mut reply = vec![0x10, 0x02, 0x01];
        reply.extend_from_slice(&[0x5a; 16]);
        reply
    }

    #[tokio::test]
    async fn should_authenticate_with_full_handshake() {
        let recorder = Arc::new(Recorder::default());
        recorder.reply_after(0, auth_uuid(), vec![0x10, 0x01, 0x01]);
        recorder.reply_after(1, auth_uuid(), challenge_reply());
        recorder.reply_after(2, auth_uuid(), vec![0x10, 0x03, 0x01]);
        let session = session(&recorder);
        session.connect(handle()).await.unwrap();

        authenticate(&session, true).await.unwrap();

        assert_eq!(session.state(), SessionState::Authenticated);
        let writes = recorder.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(&writes[0][..2], &[0x01, 0x00]);
        assert_eq!(&writes[0][2..], &[0x42; 16]);
        assert_eq!(writes[1], vec![0x02, 0x00]);
        let expected = cipher::respond(&AuthKey::new([0x42; 16]), &[0x5a; 16]);
        assert_eq!(&writes[2][..2], &[0x03, 0x00]);
        assert_eq!(&writes[2][2..], &expected);
    }

    #[tokio::test]
    async fn should_skip_key_exchange_without_full() {
        let recorder = Arc::new(Recorder::default());
        recorder.reply_after(0, auth_uuid(), challenge_reply());
        recorder.reply_after(1, auth_uuid(), vec![0x10, 0x03, 0x01]);
        let session = session(&recorder);
        session.connect(handle()).await.unwrap();

        authenticate(&session, false).await.unwrap();

        assert_eq!(recorder.writes()[0], vec![0x02, 0x00]);
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn should_report_mismatched_key() {
        let recorder = Arc::new(Recorder::default());
        recorder.reply_after(0, auth_uuid(), challenge_reply());
        recorder.reply_after(1, auth_uuid(), vec![0x10, 0x03, 0x04]);
        let session = session(&recorder);
        session.connect(handle()).await.unwrap();

        let err = authenticate(&session, false).await.unwrap_err();

        assert!(matches!(err, BandError::Auth(AuthError::MismatchedKey)));
        assert_eq!(
            session.state(),
            SessionState::Error(FaultReason::Authentication(AuthError::MismatchedKey))
        );
        assert_eq!(session.authentication_key(), Some(AuthKey::new([0x42; 16])));
    }

    #[tokio::test]
    async fn should_report_rejected_pairing() {
        let recorder = Arc::new(Recorder::default());
        recorder.reply_after(0, auth_uuid(), vec![0x10, 0x01, 0x04]);
        let session = session(&recorder);
        session.connect(handle()).await.unwrap();

        let err = authenticate(&session, true).await.unwrap_err();

        assert!(matches!(
            err,
            BandError::Auth(AuthError::DeviceRejected {
                step: 0x01,
                status: 0x04
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_when_device_is_silent() {
        let recorder = Arc::new(Recorder::default());
        let session = session(&recorder);
        session.connect(handle()).await.unwrap();

        let err = authenticate(&session, false).await.unwrap_err();

        assert!(matches!(err, BandError::Auth(AuthError::Timeout)));
        assert_eq!(
            session.state(),
            SessionState::Error(FaultReason::Authentication(AuthError::Timeout))
        );
    }

    #[tokio::test]
    async fn should_refuse_authentication_when_disconnected() {
        let recorder = Arc::new(Recorder::default());
        let session = session(&recorder);

        let err = authenticate(&session, true).await.unwrap_err();

        assert!(matches!(
            err,
            BandError::Connection(bandlink_domain::error::ConnectionError::InvalidState { .. })
        ));
        assert!(recorder.writes().is_empty());
    }
}
