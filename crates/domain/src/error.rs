//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into [`BandError`]
//! via `#[from]`. Adapter crates box their backend errors into
//! [`TransportError`] rather than leaking backend types into the domain.

use crate::address::DeviceAddress;
use crate::configuration::ConfigStep;
use crate::session::SessionState;

/// Boxed backend error carried across port boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error returned by every caller-facing operation.
#[derive(Debug, thiserror::Error)]
pub enum BandError {
    /// Scanning could not be performed.
    #[error("discovery error")]
    Discovery(#[from] DiscoveryError),

    /// The radio link could not be established or was lost.
    #[error("connection error")]
    Connection(#[from] ConnectionError),

    /// The authentication handshake failed.
    #[error("authentication error")]
    Auth(#[from] AuthError),

    /// A configuration step failed.
    #[error("configuration error")]
    Config(#[from] ConfigError),

    /// A characteristic read/write/subscribe failed.
    #[error("transport error")]
    Transport(#[from] TransportError),

    /// A guarded operation was invoked outside the `Authenticated` state.
    #[error("{operation} requires an authenticated session (current state: {state})")]
    NotAuthenticated {
        /// The rejected operation.
        operation: &'static str,
        /// The session state at the time of the call.
        state: SessionState,
    },

    /// The device did not answer in time.
    #[error("device did not respond to {operation} within {timeout_ms} ms")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The limit that was exceeded.
        timeout_ms: u64,
    },

    /// Caller-supplied input violated a domain invariant.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// The device sent something the protocol table cannot make sense of.
    #[error("protocol error")]
    Protocol(#[from] ProtocolError),

    /// Only one stream of this kind may be active per session.
    #[error("a {kind} stream is already active")]
    StreamActive {
        /// Stream kind (e.g. `"live heart rate"`).
        kind: &'static str,
    },
}

impl BandError {
    /// Whether this error means the radio link is gone.
    ///
    /// Link loss moves the session to `Disconnected`; every other failure
    /// during a protocol exchange moves it to `Error`.
    #[must_use]
    pub fn is_link_lost(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionError::Dropped | ConnectionError::NotConnected)
                | Self::Transport(TransportError::NotConnected | TransportError::StreamClosed { .. })
        )
    }

    /// Whether this error is a timeout, wherever it was raised.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Auth(AuthError::Timeout))
    }
}

/// Why scanning could not be performed.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// No BLE radio is present or it is powered off.
    #[error("no BLE radio available")]
    RadioUnavailable,

    /// The host refused access to the radio.
    #[error("permission to use the BLE radio was denied")]
    PermissionDenied,

    /// The backend failed to start or run the scan.
    #[error("scan failed")]
    Scan(#[source] BoxError),
}

/// Why a link could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The device refused or failed the link setup.
    #[error("device {address} refused the connection")]
    Refused {
        /// The device that refused.
        address: DeviceAddress,
        /// Backend error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The transport has never seen the requested device.
    #[error("device {address} is not known to the radio (run a search first)")]
    UnknownDevice {
        /// The requested address.
        address: DeviceAddress,
    },

    /// The link dropped while in use.
    #[error("link dropped")]
    Dropped,

    /// There is no link to operate on.
    #[error("not connected")]
    NotConnected,

    /// The operation is not legal from the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The session state at the time of the call.
        state: SessionState,
    },

    /// A concurrent `disconnect` superseded the operation.
    #[error("{operation} aborted by disconnect")]
    Aborted {
        /// The superseded operation.
        operation: &'static str,
    },

    /// A stream was closed because the session was disconnected.
    #[error("stream closed by disconnect")]
    Closed,

    /// A stream was ended because another exchange faulted the session.
    #[error("stream ended by a session fault")]
    Interrupted,
}

/// Authentication handshake failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The device computed a different challenge response: the key is wrong.
    #[error("device rejected the challenge response (mismatched key)")]
    MismatchedKey,

    /// The device did not answer a handshake step in time.
    #[error("device did not answer the handshake in time")]
    Timeout,

    /// The device answered a handshake step with a failure status.
    #[error("device rejected handshake step 0x{step:02x} with status 0x{status:02x}")]
    DeviceRejected {
        /// Handshake command byte.
        step: u8,
        /// Status byte reported by the device.
        status: u8,
    },

    /// The device handle carries no key.
    #[error("no authentication key available")]
    MissingKey,

    /// A notification on the auth characteristic did not match the step.
    #[error("unexpected handshake response for step 0x{step:02x}")]
    UnexpectedResponse {
        /// Handshake command byte that was awaited.
        step: u8,
    },
}

/// Configuration sequence failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A step of the ordered configuration sequence failed.
    ///
    /// Steps before `step` were applied and are not rolled back.
    #[error("configuration step {step} failed")]
    Step {
        /// The step that failed.
        step: ConfigStep,
        /// Why it failed.
        #[source]
        cause: Box<BandError>,
    },
}

impl ConfigError {
    /// The step that failed.
    #[must_use]
    pub fn step(&self) -> ConfigStep {
        match self {
            Self::Step { step, .. } => *step,
        }
    }
}

/// GATT operation kind, used for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOp {
    Read,
    Write,
    Subscribe,
    Unsubscribe,
}

impl std::fmt::Display for GattOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        })
    }
}

/// Characteristic-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A GATT operation failed.
    #[error("{op} on characteristic {characteristic} failed")]
    Gatt {
        /// The attempted operation.
        op: GattOp,
        /// Target characteristic.
        characteristic: uuid::Uuid,
        /// Backend error.
        #[source]
        source: BoxError,
    },

    /// The device does not expose the characteristic.
    #[error("characteristic {uuid} not found")]
    CharacteristicNotFound {
        /// Missing characteristic.
        uuid: uuid::Uuid,
    },

    /// The link is gone.
    #[error("transport not connected")]
    NotConnected,

    /// A notification stream ended while still awaited.
    #[error("notification stream for {characteristic} closed")]
    StreamClosed {
        /// Characteristic whose stream ended.
        characteristic: uuid::Uuid,
    },
}

/// Domain invariant violations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Quiet-hours start and end are the same time.
    #[error("quiet hours window must not start and end at the same time")]
    DegenerateQuietHours,

    /// A screen appears twice in a layout.
    #[error("screen {0} appears more than once in the layout")]
    DuplicateScreen(&'static str),

    /// A numeric field is out of its accepted range.
    #[error("{field} must be between {min} and {max}, got {actual}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
        /// Offending value.
        actual: i64,
    },

    /// A required builder field was not supplied.
    #[error("missing required field {0}")]
    MissingField(&'static str),

    /// The language code is not supported by the device.
    #[error("unsupported language code {0:?}")]
    UnsupportedLanguage(String),

    /// The device address could not be parsed.
    #[error("invalid device address {0:?}")]
    InvalidAddress(String),

    /// The authentication key could not be parsed.
    #[error("authentication key must be 32 hex characters")]
    InvalidKey,

    /// An enumerated value could not be parsed.
    #[error("unknown {field} {value:?}")]
    UnknownValue {
        /// Field name.
        field: &'static str,
        /// Offending input.
        value: String,
    },
}

/// Protocol-level violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A payload has the wrong size for its format.
    #[error("{format} payload must be {expected} bytes, got {actual}")]
    WrongLength {
        /// Format name.
        format: &'static str,
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// A payload is shorter than its format's minimum.
    #[error("{format} payload must be at least {minimum} bytes, got {actual}")]
    TooShort {
        /// Format name.
        format: &'static str,
        /// Minimum byte count.
        minimum: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// A response did not carry the expected opcode.
    #[error("unexpected {format} response {bytes:02x?}")]
    UnexpectedResponse {
        /// Format name.
        format: &'static str,
        /// The first bytes of the response.
        bytes: Vec<u8>,
    },

    /// A field carried an impossible value.
    #[error("invalid {field} value {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: i64,
    },

    /// The protocol table has no entry for a command.
    #[error("command {0} is not supported by this protocol revision")]
    UnsupportedCommand(&'static str),

    /// The protocol table has no entry for a channel.
    #[error("channel {0} is not mapped by this protocol revision")]
    UnknownChannel(&'static str),

    /// The device reported a failure status for a command.
    #[error("device reported status 0x{status:02x} for {command}")]
    CommandFailed {
        /// Command name.
        command: &'static str,
        /// Status byte.
        status: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_not_authenticated_with_state() {
        let err = BandError::NotAuthenticated {
            operation: "configure",
            state: SessionState::Connected,
        };
        assert_eq!(
            err.to_string(),
            "configure requires an authenticated session (current state: connected)"
        );
    }

    #[test]
    fn should_display_timeout_with_operation() {
        let err = BandError::Timeout {
            operation: "connect",
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "device did not respond to connect within 5000 ms"
        );
    }

    #[test]
    fn should_classify_link_loss() {
        assert!(BandError::from(TransportError::NotConnected).is_link_lost());
        assert!(BandError::from(ConnectionError::Dropped).is_link_lost());
        assert!(
            BandError::from(TransportError::StreamClosed {
                characteristic: uuid::Uuid::nil()
            })
            .is_link_lost()
        );
        assert!(!BandError::from(AuthError::MismatchedKey).is_link_lost());
    }

    #[test]
    fn should_classify_timeouts() {
        assert!(BandError::from(AuthError::Timeout).is_timeout());
        assert!(
            BandError::Timeout {
                operation: "read",
                timeout_ms: 1
            }
            .is_timeout()
        );
        assert!(!BandError::from(ValidationError::DegenerateQuietHours).is_timeout());
    }

    #[test]
    fn should_expose_failed_config_step() {
        let err = ConfigError::Step {
            step: ConfigStep::Screens,
            cause: Box::new(TransportError::NotConnected.into()),
        };
        assert_eq!(err.step(), ConfigStep::Screens);
        assert_eq!(err.to_string(), "configuration step screens failed");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "transport error");
    }

    #[test]
    fn should_display_device_rejected_in_hex() {
        let err = AuthError::DeviceRejected {
            step: 0x01,
            status: 0x04,
        };
        assert_eq!(
            err.to_string(),
            "device rejected handshake step 0x01 with status 0x04"
        );
    }

    #[test]
    fn should_display_wrong_length_protocol_error() {
        let err = ProtocolError::WrongLength {
            format: "history metadata",
            expected: 15,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "history metadata payload must be 15 bytes, got 3"
        );
    }
}
