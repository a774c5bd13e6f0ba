//! Signal handling for the supervisor.
//!
//! Handlers only store into atomics. The main loop drains the flags and
//! turns them into deferred actions, so no supervisor state is touched from
//! signal context.
//!
//! - `SIGINT` / `SIGTERM`: shutdown
//! - `SIGUSR1` / `SIGHUP`: graceful reload
//! - `SIGCHLD`: a worker exited

use signal_hook::SigId;
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::flag;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Flags shared between signal handlers and the main loop.
///
/// Clones share the same flags, so a clone doubles as a handle for
/// requesting reload or shutdown programmatically.
#[derive(Debug, Clone, Default)]
pub struct SignalFlags {
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    child_exited: Arc<AtomicBool>,
}

impl SignalFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install handlers that set these flags.
    ///
    /// Handlers stay installed until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns the `sigaction` failure.
    pub fn register(&self) -> std::io::Result<SignalRegistration> {
        let mut ids = Vec::with_capacity(5);
        ids.push(flag::register(SIGTERM, Arc::clone(&self.shutdown))?);
        ids.push(flag::register(SIGINT, Arc::clone(&self.shutdown))?);
        ids.push(flag::register(SIGUSR1, Arc::clone(&self.reload))?);
        ids.push(flag::register(SIGHUP, Arc::clone(&self.reload))?);
        ids.push(flag::register(SIGCHLD, Arc::clone(&self.child_exited))?);
        Ok(SignalRegistration { ids })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn notify_child_exited(&self) {
        self.child_exited.store(true, Ordering::SeqCst);
    }

    /// Shutdown is sticky: once requested it stays requested.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Returns true if a reload was requested and clears the flag.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    /// Returns true if a child exited and clears the flag.
    pub fn take_child_exited(&self) -> bool {
        self.child_exited.swap(false, Ordering::SeqCst)
    }
}

/// Installed signal handlers; removed on drop.
#[derive(Debug)]
pub struct SignalRegistration {
    ids: Vec<SigId>,
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
