//! Session state: the single source of truth for which operations are legal.

use std::fmt;

use crate::configuration::ConfigStep;
use crate::error::{AuthError, BandError};

/// Lifecycle state of the link to one tracker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    /// A protocol exchange failed; requires `disconnect` before retrying.
    Error(FaultReason),
}

impl SessionState {
    /// Whether a radio link is currently up.
    #[must_use]
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Authenticating | Self::Authenticated
        )
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Authenticated => f.write_str("authenticated"),
            Self::Error(reason) => write!(f, "error ({reason})"),
        }
    }
}

/// Why a session ended up in [`SessionState::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultReason {
    Authentication(AuthError),
    Timeout { operation: &'static str },
    Configuration { step: ConfigStep },
    Transport,
    Protocol,
}

impl From<&BandError> for FaultReason {
    fn from(err: &BandError) -> Self {
        match err {
            BandError::Auth(auth) => Self::Authentication(auth.clone()),
            BandError::Timeout { operation, .. } => Self::Timeout {
                operation: *operation,
            },
            BandError::Config(config) => Self::Configuration {
                step: config.step(),
            },
            BandError::Protocol(_) => Self::Protocol,
            _ => Self::Transport,
        }
    }
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication(err) => write!(f, "authentication failed: {err}"),
            Self::Timeout { operation } => write!(f, "{operation} timed out"),
            Self::Configuration { step } => write!(f, "configuration step {step} failed"),
            Self::Transport => f.write_str("transport failure"),
            Self::Protocol => f.write_str("protocol violation"),
        }
    }
}
