//! Error taxonomy shared by the pace, target, link and session modules.

use thiserror::Error;

pub type Result<T, E = RigError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RigError {
    /// A pace of 0'00" has no speed.
    #[error("pace must be longer than 0'00\"")]
    InvalidPace,

    #[error("invalid pace \"{0}\", expected M:SS with seconds 00-59")]
    InvalidPaceFormat(String),

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: f64 },

    #[error("no rig available: {0}")]
    LinkUnavailable(String),

    #[error("could not open the rig's serial characteristic: {0}")]
    LinkEstablishFailed(String),

    #[error("command write failed: {0}")]
    SendFailed(String),

    #[error("no pace option matches {speed_kmh:.1} km/h")]
    NoMatchingPace { speed_kmh: f64 },

    #[error("cannot {action} while {from}")]
    InvalidStateTransition {
        from: &'static str,
        action: &'static str,
    },
}

impl RigError {
    pub fn invalid_state(from: &'static str, action: &'static str) -> Self {
        RigError::InvalidStateTransition { from, action }
    }

    /// Connect-time failures the operator can clear by trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RigError::LinkUnavailable(_) | RigError::LinkEstablishFailed(_) | RigError::SendFailed(_)
        )
    }
}

/// Failures reported by a [`crate::link::LinkTransport`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no matching peripheral found")]
    NotFound,

    #[error("device selection cancelled")]
    Cancelled,

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("write error: {0}")]
    Write(String),
}

impl From<TransportError> for RigError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound | TransportError::Cancelled => {
                RigError::LinkUnavailable(err.to_string())
            }
            TransportError::Gatt(reason) => RigError::LinkEstablishFailed(reason),
            TransportError::Write(reason) => RigError::SendFailed(reason),
        }
    }
}
