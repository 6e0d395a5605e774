use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a single operation instruction.
///
/// Valid transitions are `NotStarted → Started → Completed`, `Started → Failed`,
/// and any non-terminal status `→ Aborted`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Accepted but waiting for its turn.
    #[default]
    NotStarted,
    /// The operation implementation is running.
    Started,
    /// The implementation returned successfully.
    Completed,
    /// The implementation reported an error.
    Failed,
    /// Cancelled before it could finish.
    Aborted,
}

impl OperationStatus {
    /// Returns true once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Returns true when moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Started)
                | (Self::Started, Self::Completed)
                | (Self::Started, Self::Failed)
                | (Self::NotStarted, Self::Aborted)
                | (Self::Started, Self::Aborted)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not_started",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}
