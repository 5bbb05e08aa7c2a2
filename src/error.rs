//! Custom error types for the session controller.
//!
//! Every layer of the controller has its own `thiserror` enum, and the
//! controller-level [`SessionError`] absorbs the lower ones through `#[from]`:
//!
//! - **[`ClaimError`]**: rejections from the exclusive board pool.
//! - **[`ChannelError`]**: rejections and activation outcomes from a single
//!   power channel state machine.
//! - **[`SessionError`]**: everything a caller of the session controller can
//!   see, including session-wide gates such as the interlock and expert mode.
//! - **[`ConfigError`]**: loading and validation of the station configuration.
//!
//! ## Error classes
//!
//! Errors are grouped into three classes (see [`ErrorClass`]):
//!
//! - **Usage**: malformed requests (`UnknownResource`, `InvalidSelection`).
//!   Surfaced immediately and never retried.
//! - **Instrument**: the device was absent or did not answer. Captured as a
//!   state-machine outcome (`ActivationFailed`, board status `Error`); the
//!   operator may retry.
//! - **Policy**: well-formed requests that would break an invariant
//!   (`AlreadyClaimed`, `ChannelBusy`, `InterlockActive`, ...). Recoverable by
//!   changing the request or clearing the blocking condition.
//!
//! `InterlockActive` is the only error behind a one-way gate: it clears only
//! through an explicit interlock reset.

use crate::channel::PowerRole;
use thiserror::Error;

/// Convenience alias for results using the session error type.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Classification of every error the controller can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad arguments from the caller.
    Usage,
    /// Device absent or unresponsive.
    Instrument,
    /// Well-formed request rejected by an invariant.
    Policy,
}

/// Rejections from the exclusive board pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("Unknown board '{0}'")]
    UnknownResource(String),

    #[error("Board '{held}' is already claimed")]
    AlreadyClaimed {
        /// Board currently holding the claim
        held: String,
    },

    #[error("Board '{0}' is not ready (status must be Ok before claiming)")]
    NotReady(String),

    #[error("Board '{0}' is not the claimed board")]
    NotClaimedByCaller(String),
}

impl ClaimError {
    /// Error class of this rejection.
    pub fn class(&self) -> ErrorClass {
        match self {
            ClaimError::UnknownResource(_) => ErrorClass::Usage,
            ClaimError::AlreadyClaimed { .. }
            | ClaimError::NotReady(_)
            | ClaimError::NotClaimedByCaller(_) => ErrorClass::Policy,
        }
    }
}

/// Rejections and failed outcomes of a power channel transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("{0} channel is under manual (front panel) control")]
    RemoteControlDisabled(PowerRole),

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("{0} channel is busy; release it first")]
    ChannelBusy(PowerRole),

    #[error("{role} activation failed: {reason}")]
    ActivationFailed {
        /// Rail that failed to activate
        role: PowerRole,
        /// Human-readable failure cause (device status or I/O error)
        reason: String,
    },

    #[error("{0} channel is not active")]
    NotActive(PowerRole),

    #[error("Interlock tripped while the {0} channel was activating")]
    InterlockTripped(PowerRole),

    #[error("{role} output command failed: {reason}")]
    OutputFailed {
        /// Rail whose output command failed
        role: PowerRole,
        /// Device error text
        reason: String,
    },
}

impl ChannelError {
    /// Error class of this channel outcome.
    pub fn class(&self) -> ErrorClass {
        match self {
            ChannelError::InvalidSelection(_) => ErrorClass::Usage,
            ChannelError::ActivationFailed { .. } | ChannelError::OutputFailed { .. } => {
                ErrorClass::Instrument
            }
            ChannelError::RemoteControlDisabled(_)
            | ChannelError::ChannelBusy(_)
            | ChannelError::NotActive(_)
            | ChannelError::InterlockTripped(_) => ErrorClass::Policy,
        }
    }
}

/// Errors surfaced by the session controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Safety interlock is tripped; reset it before continuing")]
    InterlockActive,

    #[error("Operation '{0}' requires expert mode")]
    ExpertModeRequired(String),

    #[error("A test is in progress")]
    TestInProgress,

    #[error("No board is claimed")]
    NoBoardClaimed,

    #[error("Session has shut down")]
    SessionClosed,
}

impl SessionError {
    /// Error class used by callers to decide between fixing the request,
    /// retrying, or clearing a blocking condition.
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Claim(err) => err.class(),
            SessionError::Channel(err) => err.class(),
            SessionError::InterlockActive
            | SessionError::ExpertModeRequired(_)
            | SessionError::TestInProgress
            | SessionError::NoBoardClaimed
            | SessionError::SessionClosed => ErrorClass::Policy,
        }
    }

    /// True for the interlock rejection, which only an explicit reset clears.
    pub fn is_one_way_gate(&self) -> bool {
        matches!(self, SessionError::InterlockActive)
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        ConfigError::Load(Box::new(value))
    }
}
