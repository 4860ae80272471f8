//! Lifecycle states of a feedback process.

use std::fmt;
use std::str::FromStr;

/// ```text
/// Created → Initialized → Playing ⇄ Paused
///                 └──────────┴───────┴──→ Stopped
/// any ──(forced kill)──→ Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackState {
    Created,
    Initialized,
    Playing,
    Paused,
    Stopped,
    Terminated,
}

impl FeedbackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        }
    }

    /// The process is gone or will never run feedback code again.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Stopped | Self::Terminated)
    }

    /// Init completed and the feedback has not stopped yet.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Initialized | Self::Playing | Self::Paused)
    }
}

impl fmt::Display for FeedbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown feedback state: {0:?}")]
pub struct UnknownState(pub String);

impl FromStr for FeedbackState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "initialized" => Self::Initialized,
            "playing" => Self::Playing,
            "paused" => Self::Paused,
            "stopped" => Self::Stopped,
            "terminated" => Self::Terminated,
            other => return Err(UnknownState(other.to_string())),
        })
    }
}
