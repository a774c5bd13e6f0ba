//! Handle for requesting reload or shutdown.

use crate::signals::SignalFlags;

/// Handle for triggering supervisor actions.
///
/// This handle can be cloned and handed to anything that needs to reload or
/// stop the supervisor. It sets the same flags the signal handlers set, so a
/// request is picked up on the next tick exactly like a signal.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    flags: SignalFlags,
}

impl SupervisorHandle {
    pub(super) fn new(flags: SignalFlags) -> Self {
        Self { flags }
    }

    /// Request a graceful reload, as `SIGUSR1` would.
    pub fn request_reload(&self) {
        self.flags.request_reload();
    }

    /// Request shutdown, as `SIGTERM` would.
    pub fn request_shutdown(&self) {
        self.flags.request_shutdown();
    }

    /// Report that a worker may have exited, as `SIGCHLD` would.
    pub fn notify_child_exited(&self) {
        self.flags.notify_child_exited();
    }
}
