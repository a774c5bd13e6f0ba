//! Error types for the supervisor.
//!
//! Errors that abort an operation (a build, a reload, startup) are variants
//! of [`Error`]. Failures during teardown are never fatal: they are collected
//! as [`TeardownError`]s into a [`TeardownReport`] so the remaining handles
//! are still released.

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::socket::SocketKey;

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Supervisor errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The address is held by a process outside the supervisor.
    #[error("failed to bind {key}: {source}")]
    Bind {
        key: SocketKey,
        #[source]
        source: std::io::Error,
    },

    /// Configuration was rejected by the validator.
    #[error("configuration validation failed: {reason}")]
    ConfigValidation { reason: String },

    /// Configuration could not be read or has the wrong shape.
    #[error("configuration error: {0}")]
    Config(String),

    /// The supervisor could not fork a worker.
    #[error("failed to spawn worker {index} of service '{service}': {source}")]
    WorkerSpawn {
        service: String,
        index: usize,
        #[source]
        source: Errno,
    },

    /// Detaching from the terminal or pidfile handling failed.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a bind error for a socket key.
    pub fn bind(key: SocketKey, source: std::io::Error) -> Self {
        Self::Bind { key, source }
    }

    /// Create a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ConfigValidation {
            reason: reason.into(),
        }
    }

    /// Create a worker spawn error.
    pub fn worker_spawn(service: impl Into<String>, index: usize, source: Errno) -> Self {
        Self::WorkerSpawn {
            service: service.into(),
            index,
            source,
        }
    }

    /// Returns true if this error aborted a reload while leaving the running
    /// generation untouched.
    #[must_use]
    pub fn is_reload_abort(&self) -> bool {
        matches!(
            self,
            Self::Bind { .. }
                | Self::ConfigValidation { .. }
                | Self::Config(_)
                | Self::WorkerSpawn { .. }
        )
    }
}

/// A single failed teardown step.
#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("failed to signal worker {pid}: {source}")]
    Kill {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("failed to reap worker {pid}: {source}")]
    Reap {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("failed to close socket {key}: {source}")]
    Close {
        key: SocketKey,
        #[source]
        source: Errno,
    },

    #[error("failed to unlink socket path {key}: {source}")]
    Unlink {
        key: SocketKey,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a best-effort teardown.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Workers that were signalled.
    pub signalled: usize,
    /// Workers that were reaped.
    pub reaped: usize,
    /// Sockets that were closed.
    pub closed: usize,
    /// Steps that failed; each one was skipped and teardown continued.
    pub errors: Vec<TeardownError>,
}

impl TeardownReport {
    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: TeardownReport) {
        self.signalled += other.signalled;
        self.reaped += other.reaped;
        self.closed += other.closed;
        self.errors.extend(other.errors);
    }

    /// Log every failed step at warn level.
    pub fn log_errors(&self) {
        for error in &self.errors {
            tracing::warn!(error = %error, "Teardown step failed, continuing");
        }
    }
}
