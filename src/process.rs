//! Process control: forking workers, signalling and reaping them.
//!
//! [`ProcessControl`] is the seam between the lifecycle logic (worker
//! groups, generations, the supervisor) and the operating system. The real
//! implementation, [`ForkProcess`], forks; tests substitute a recording
//! implementation so ownership and ordering invariants can be checked
//! without creating processes.

use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, error};

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::generation::GenerationId;
use crate::server::{ServerFactory, WorkerContext};
use crate::socket::SocketHandle;

/// Exit code of a worker that failed to start.
pub const WORKER_STARTUP_FAILURE: i32 = 1;

/// Signals whose supervisor handlers must not leak into workers.
const RESET_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGCHLD,
];

/// How a reaped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(Signal),
    /// The process had already been reaped elsewhere.
    Unknown,
}

impl ExitState {
    fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::Signaled(signal)),
            _ => None,
        }
    }
}

/// Everything needed to start one worker.
#[derive(Debug)]
pub struct WorkerLaunch<'a> {
    pub generation: GenerationId,
    pub service: &'a str,
    pub index: usize,
    pub config: &'a ServiceConfig,
    pub socket: &'a SocketHandle,
    /// Descriptors the worker must close: every socket that is not its own.
    pub foreign_fds: &'a [RawFd],
    pub predecessor: Option<Pid>,
}

/// Operating-system operations on worker processes.
pub trait ProcessControl {
    /// Start a worker and return its pid. Never blocks on the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerSpawn`] if the process cannot be created.
    fn spawn_worker(&mut self, launch: &WorkerLaunch<'_>) -> Result<Pid>;

    /// Send `signal` to `pid`.
    ///
    /// # Errors
    ///
    /// Returns the errno; `ESRCH` means the process is already gone.
    fn send_signal(&mut self, pid: Pid, signal: Signal) -> nix::Result<()>;

    /// Block until `pid` exits.
    ///
    /// # Errors
    ///
    /// Returns the errno from `waitpid`. Implementations map `ECHILD` to
    /// [`ExitState::Unknown`].
    fn reap(&mut self, pid: Pid) -> nix::Result<ExitState>;

    /// Reap `pid` if it has exited, without blocking.
    ///
    /// # Errors
    ///
    /// Returns the errno from `waitpid`.
    fn try_reap(&mut self, pid: Pid) -> nix::Result<Option<ExitState>>;
}

/// Forks real worker processes running servers from `F`.
pub struct ForkProcess<F> {
    factory: F,
}

impl<F: ServerFactory> ForkProcess<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F: ServerFactory> ProcessControl for ForkProcess<F> {
    fn spawn_worker(&mut self, launch: &WorkerLaunch<'_>) -> Result<Pid> {
        // SAFETY: the supervisor is single-threaded; the child only runs
        // worker code and leaves through `std::process::exit`.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!(service = launch.service, worker = launch.index, pid = %child, "Forked worker");
                Ok(child)
            },
            Ok(ForkResult::Child) => {
                let code = run_worker(&self.factory, launch);
                std::process::exit(code)
            },
            Err(errno) => Err(Error::worker_spawn(launch.service, launch.index, errno)),
        }
    }

    fn send_signal(&mut self, pid: Pid, signal: Signal) -> nix::Result<()> {
        kill(pid, signal)
    }

    fn reap(&mut self, pid: Pid) -> nix::Result<ExitState> {
        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    if let Some(state) = ExitState::from_status(status) {
                        return Ok(state);
                    }
                },
                Err(Errno::EINTR) => {},
                Err(Errno::ECHILD) => return Ok(ExitState::Unknown),
                Err(e) => return Err(e),
            }
        }
    }

    fn try_reap(&mut self, pid: Pid) -> nix::Result<Option<ExitState>> {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => Ok(ExitState::from_status(status)),
            Err(Errno::ECHILD) => Ok(Some(ExitState::Unknown)),
            Err(e) => Err(e),
        }
    }
}

/// Body of a forked worker. Returns the process exit code.
fn run_worker<F: ServerFactory>(factory: &F, launch: &WorkerLaunch<'_>) -> i32 {
    reset_signal_dispositions();

    for &fd in launch.foreign_fds {
        let _ = nix::unistd::close(fd);
    }

    let socket = match launch.socket.try_clone_socket() {
        Ok(socket) => socket,
        Err(e) => {
            error!(service = launch.service, worker = launch.index, error = %e, "Failed to duplicate socket");
            return WORKER_STARTUP_FAILURE;
        },
    };

    let context = WorkerContext {
        generation: launch.generation,
        service: launch.service.to_string(),
        index: launch.index,
        key: launch.socket.key().clone(),
        socket,
        hooks: launch.config.hooks.clone(),
        options: launch.config.options.clone(),
        predecessor: launch.predecessor,
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut server = factory.build(context)?;
        server.serve_forever()
    }));

    match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!(service = launch.service, worker = launch.index, error = %format!("{e:#}"), "Worker failed");
            WORKER_STARTUP_FAILURE
        },
        Err(_) => {
            error!(service = launch.service, worker = launch.index, "Worker panicked");
            WORKER_STARTUP_FAILURE
        },
    }
}

/// Put supervisor-handled signals back to their default action.
fn reset_signal_dispositions() {
    for sig in RESET_SIGNALS {
        // SAFETY: installing SIG_DFL does not run any handler code.
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_state_from_status() {
        let pid = Pid::from_raw(10);
        assert_eq!(
            ExitState::from_status(WaitStatus::Exited(pid, 3)),
            Some(ExitState::Exited(3))
        );
        assert_eq!(
            ExitState::from_status(WaitStatus::Signaled(pid, Signal::SIGINT, false)),
            Some(ExitState::Signaled(Signal::SIGINT))
        );
        assert_eq!(ExitState::from_status(WaitStatus::StillAlive), None);
    }
}
