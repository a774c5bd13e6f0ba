//! Per-generation set of listening sockets.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, info};

use super::handle::SocketHandle;
use super::key::SocketKey;
use crate::error::{Result, TeardownReport};

/// Default `listen(2)` backlog for stream sockets.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Listening sockets owned by one generation, keyed by transport and address.
#[derive(Debug)]
pub struct SocketRegistry {
    sockets: HashMap<SocketKey, SocketHandle>,
    backlog: i32,
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

impl SocketRegistry {
    pub fn new(backlog: i32) -> Self {
        Self {
            sockets: HashMap::new(),
            backlog,
        }
    }

    /// Return the socket for `key`, claiming it from `predecessor` if the
    /// predecessor holds one, otherwise binding a new one.
    ///
    /// Claiming is a move: afterwards the predecessor no longer holds the
    /// key, so the descriptor stays open across the reload and is never
    /// rebound.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Bind`] if a new socket cannot be bound.
    pub fn get_or_create(
        &mut self,
        key: &SocketKey,
        predecessor: Option<&mut SocketRegistry>,
    ) -> Result<&SocketHandle> {
        if !self.sockets.contains_key(key) {
            let handle = match predecessor.and_then(|p| p.sockets.remove(key)) {
                Some(mut handle) => {
                    info!(socket = %key, fd = handle.as_raw_fd(), "Reusing socket from previous generation");
                    handle.set_inherited(true);
                    handle
                },
                None => {
                    let handle = SocketHandle::open(key.clone(), self.backlog)?;
                    info!(socket = %key, fd = handle.as_raw_fd(), "Created socket");
                    handle
                },
            };
            self.sockets.insert(key.clone(), handle);
        }

        Ok(&self.sockets[key])
    }

    /// Move every inherited socket back into `predecessor`.
    ///
    /// Used when a build is abandoned so the generation that is still
    /// serving keeps its sockets for the next reload attempt. Returns the
    /// number of sockets moved.
    pub fn restore_inherited(&mut self, predecessor: &mut SocketRegistry) -> usize {
        let keys: Vec<SocketKey> = self
            .sockets
            .iter()
            .filter(|(_, handle)| handle.is_inherited())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(mut handle) = self.sockets.remove(key) {
                handle.set_inherited(false);
                debug!(socket = %key, "Returning socket to previous generation");
                predecessor.sockets.insert(key.clone(), handle);
            }
        }

        keys.len()
    }

    /// Close every socket still held here.
    ///
    /// Anything a successor wanted has already been moved out, so what
    /// remains is unclaimed. Each socket is closed independently; failures
    /// are reported and the rest are still released. A second call finds an
    /// empty registry and does nothing.
    pub fn close_unclaimed(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        for (key, handle) in self.sockets.drain() {
            debug!(socket = %key, "Closing unclaimed socket");
            let errors = handle.close();
            if errors.is_empty() {
                report.closed += 1;
            }
            report.errors.extend(errors);
        }

        report
    }

    pub fn get(&self, key: &SocketKey) -> Option<&SocketHandle> {
        self.sockets.get(key)
    }

    pub fn contains(&self, key: &SocketKey) -> bool {
        self.sockets.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SocketKey> {
        self.sockets.keys()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Descriptors of every socket except the one for `keep`.
    ///
    /// Workers close these after fork so they only hold their own socket.
    pub fn raw_fds_except(&self, keep: &SocketKey) -> Vec<RawFd> {
        self.sockets
            .iter()
            .filter(|(key, _)| *key != keep)
            .map(|(_, handle)| handle.as_raw_fd())
            .collect()
    }

    /// Descriptors of every socket in the registry.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.sockets.values().map(AsRawFd::as_raw_fd).collect()
    }
}

impl Drop for SocketRegistry {
    fn drop(&mut self) {
        if !self.sockets.is_empty() {
            self.close_unclaimed().log_errors();
        }
    }
}
