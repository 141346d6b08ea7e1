use std::fmt;

use crate::error::LinkError;
use crate::link::{CharacteristicRef, DisconnectReason};

/// Phase of one connect→operate→disconnect cycle. Owned by the session; the
/// supervisor only ever sees the final `CycleOutcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    SecuringSession,
    DiscoveringServices,
    Subscribing,
    Active,
    TearingDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::SecuringSession => "securing-session",
            SessionState::DiscoveringServices => "discovering-services",
            SessionState::Subscribing => "subscribing",
            SessionState::Active => "active",
            SessionState::TearingDown => "tearing-down",
        };
        write!(f, "{}", text)
    }
}

/// How a cycle ended. The supervisor's backoff policy keys off this.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The remote did not answer within the connect deadline. Expected
    /// absence, retried quietly.
    ConnectTimeout,

    /// Fresh pairing failed outright.
    PairingFailed,

    /// The controller state is corrupted; the radio object must be discarded
    /// and recreated before the next attempt.
    ControllerCorrupted,

    /// The link ended after the session was active.
    Disconnected { reason: Option<DisconnectReason> },

    /// A link operation failed mid-cycle; retried within the normal loop.
    LinkFailed(LinkError),

    /// Operator intervention required; the session loop halts.
    Fatal(String),

    /// The supervisor asked the session to stop.
    Stopped,
}

impl From<LinkError> for CycleOutcome {
    fn from(err: LinkError) -> Self {
        CycleOutcome::LinkFailed(err)
    }
}

/// Binds a report id to the characteristic notifying for it. Lives only as
/// long as the session cycle that created it.
#[derive(Debug, Clone)]
pub struct ReportBinding {
    pub report_id: u8,
    pub characteristic: CharacteristicRef,
}
