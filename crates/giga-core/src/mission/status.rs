//! Mission lifecycle states and the transitions between them.

use std::fmt;

/// Overall state of a mission, stored as text in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissionStatus {
    Pending,
    Running,
    Paused,
    Finished,
    Error,
}

impl MissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MissionStatus::Pending => "pending",
            MissionStatus::Running => "running",
            MissionStatus::Paused => "paused",
            MissionStatus::Finished => "finished",
            MissionStatus::Error => "error",
        }
    }

    /// Parses a stored status. Unknown text is `None`; the store treats that as corruption.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MissionStatus::Pending),
            "running" => Some(MissionStatus::Running),
            "paused" => Some(MissionStatus::Paused),
            "finished" => Some(MissionStatus::Finished),
            "error" => Some(MissionStatus::Error),
            _ => None,
        }
    }

    /// Whether the engine may move a mission from `self` to `to`.
    ///
    /// `Running -> Pending` is crash recovery and protocol restarts; `Paused -> Pending`
    /// and `Error -> Pending` re-queue a mission behind the running cap.
    pub fn can_transition_to(self, to: MissionStatus) -> bool {
        use MissionStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Paused)
                | (Running, Paused)
                | (Running, Finished)
                | (Running, Error)
                | (Running, Pending)
                | (Paused, Pending)
                | (Paused, Running)
                | (Error, Pending)
                | (Error, Running)
        )
    }

    /// Finished missions never run again.
    pub fn is_terminal(self) -> bool {
        self == MissionStatus::Finished
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
