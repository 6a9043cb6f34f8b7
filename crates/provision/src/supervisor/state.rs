use std::fmt;

use serde::Serialize;

/// Lifecycle of one VM.
///
/// ```text
/// Created ──> Starting ──> Running ──> Stopping ──> Stopped
///    │           │                       │  ▲
///    └───────────┴────────> Failed <─────┘  │
///                             └─────────────┘ (retry stop)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl VmState {
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Created, Starting | Failed)
                | (Starting, Running | Failed)
                | (Running, Stopping)
                | (Stopping, Stopped | Failed)
                | (Failed, Stopping)
        )
    }

    /// Whether an operation is still in flight for the VM.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Created | Self::Starting | Self::Stopping)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
