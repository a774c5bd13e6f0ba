//! Supervisor lifecycle state and deferred actions.

use std::fmt;

/// Lifecycle of the supervisor.
///
/// `Starting -> Running -> (Reloading -> Running)* -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Reloading,
    Stopping,
    Stopped,
}

impl SupervisorState {
    /// Whether a reload may begin from this state.
    pub fn accepts_reload(self) -> bool {
        self == Self::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Reloading => "reloading",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work requested from signal context, run later by the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    GracefulReload,
    ReapWorkers,
}
