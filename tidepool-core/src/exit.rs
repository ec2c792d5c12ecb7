//! Exit reasons for actors and connections.

use serde::{Deserialize, Serialize};

/// Why an actor (or its stand-in proxy) went away.
///
/// Travels inside `down_message` payloads and is handed to monitors and
/// bounced requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Regular termination.
    Normal,
    /// The hosting system shut down.
    Shutdown,
    /// The remote side could not determine a reason (e.g. the actor was
    /// already gone when a monitor arrived).
    Unknown,
    /// The actor was killed.
    Kill,
    /// A reason reported by a remote peer or a connection-level failure.
    Remote(String),
}

impl ExitReason {
    /// Wire code for this reason.
    pub fn code(&self) -> u8 {
        match self {
            ExitReason::Normal => 0,
            ExitReason::Shutdown => 1,
            ExitReason::Unknown => 2,
            ExitReason::Kill => 3,
            ExitReason::Remote(_) => 4,
        }
    }

    /// Reconstruct a reason from its wire code and optional description.
    pub fn from_code(code: u8, description: String) -> Option<Self> {
        match code {
            0 => Some(ExitReason::Normal),
            1 => Some(ExitReason::Shutdown),
            2 => Some(ExitReason::Unknown),
            3 => Some(ExitReason::Kill),
            4 => Some(ExitReason::Remote(description)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::Unknown => write!(f, "unknown"),
            ExitReason::Kill => write!(f, "kill"),
            ExitReason::Remote(reason) => write!(f, "remote: {}", reason),
        }
    }
}
