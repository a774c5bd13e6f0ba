//! Worker processes of one service.
//!
//! A [`WorkerGroup`] owns the [`WorkerHandle`]s for one named service in
//! one generation. All of a group's workers share the service's listening
//! socket; every other socket is closed in the child right after fork.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{Result, TeardownError, TeardownReport};
use crate::generation::GenerationId;
use crate::process::{ExitState, ProcessControl, WorkerLaunch};
use crate::socket::SocketHandle;

mod restart;

pub use restart::{DEFAULT_RESET_AFTER, RestartPolicy, RestartState};


/// A forked worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub pid: Pid,
    pub service: String,
    pub index: usize,
    pub generation: GenerationId,
    pub started_at: Instant,
}

/// The workers serving one service.
#[derive(Debug)]
pub struct WorkerGroup {
    service: String,
    generation: GenerationId,
    config: ServiceConfig,
    workers: Vec<WorkerHandle>,
    restarts: BTreeMap<usize, RestartState>,
}

impl WorkerGroup {
    pub fn new(generation: GenerationId, service: impl Into<String>, config: ServiceConfig) -> Self {
        Self {
            service: service.into(),
            generation,
            config,
            workers: Vec::new(),
            restarts: BTreeMap::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Fork `count` workers on `socket`.
    ///
    /// Worker `i` is told about the predecessor worker recorded for index
    /// `i`, when there is one, so it can coordinate a handoff with the worker
    /// it replaces. Returns as soon
    /// as every child is forked.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::WorkerSpawn`] if a fork fails. Workers forked
    /// before the failure stay recorded so the caller can tear them down.
    pub fn spawn(
        &mut self,
        process: &mut dyn ProcessControl,
        count: usize,
        socket: &SocketHandle,
        foreign_fds: &[RawFd],
        predecessor_pids: &BTreeMap<usize, Pid>,
    ) -> Result<&[WorkerHandle]> {
        let start = self.workers.len();
        for index in 0..count {
            self.spawn_one(
                process,
                index,
                socket,
                foreign_fds,
                predecessor_pids.get(&index).copied(),
            )?;
        }

        info!(
            service = %self.service,
            generation = %self.generation,
            workers = count,
            "Spawned worker group"
        );
        Ok(&self.workers[start..])
    }

    /// Fork a single worker for `index` and record it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::WorkerSpawn`] if the fork fails.
    pub fn spawn_one(
        &mut self,
        process: &mut dyn ProcessControl,
        index: usize,
        socket: &SocketHandle,
        foreign_fds: &[RawFd],
        predecessor: Option<Pid>,
    ) -> Result<Pid> {
        let launch = WorkerLaunch {
            generation: self.generation,
            service: &self.service,
            index,
            config: &self.config,
            socket,
            foreign_fds,
            predecessor,
        };
        let pid = process.spawn_worker(&launch)?;

        self.workers.push(WorkerHandle {
            pid,
            service: self.service.clone(),
            index,
            generation: self.generation,
            started_at: Instant::now(),
        });
        Ok(pid)
    }

    /// Send `signal` to every worker without waiting.
    ///
    /// A worker that is already gone counts as done.
    pub fn kill_all(&self, process: &mut dyn ProcessControl, signal: Signal) -> TeardownReport {
        let mut report = TeardownReport::default();

        for worker in &self.workers {
            match process.send_signal(worker.pid, signal) {
                Ok(()) => report.signalled += 1,
                Err(Errno::ESRCH) => {
                    debug!(pid = %worker.pid, "Worker already exited");
                },
                Err(source) => report.errors.push(TeardownError::Kill {
                    pid: worker.pid,
                    source,
                }),
            }
        }

        report
    }

    /// Block until every worker has been reaped.
    ///
    /// Workers that could not be reaped stay in the group so a later call
    /// can try again.
    pub fn wait_all(&mut self, process: &mut dyn ProcessControl) -> TeardownReport {
        let mut report = TeardownReport::default();
        let mut remaining = Vec::new();

        for worker in self.workers.drain(..) {
            match process.reap(worker.pid) {
                Ok(state) => {
                    debug!(pid = %worker.pid, service = %worker.service, state = ?state, "Worker reaped");
                    report.reaped += 1;
                },
                Err(source) => {
                    report.errors.push(TeardownError::Reap {
                        pid: worker.pid,
                        source,
                    });
                    remaining.push(worker);
                },
            }
        }

        self.workers = remaining;
        report
    }

    /// Reap workers that have already exited, without blocking.
    pub fn reap_exited(&mut self, process: &mut dyn ProcessControl) -> Vec<(WorkerHandle, ExitState)> {
        let mut exited = Vec::new();
        let mut running = Vec::with_capacity(self.workers.len());

        for worker in self.workers.drain(..) {
            match process.try_reap(worker.pid) {
                Ok(Some(state)) => exited.push((worker, state)),
                Ok(None) => running.push(worker),
                Err(e) => {
                    warn!(pid = %worker.pid, error = %e, "Failed to poll worker");
                    running.push(worker);
                },
            }
        }

        self.workers = running;
        exited
    }

    /// Schedule a respawn of slot `index` after its worker exited at `now`
    /// having run for `uptime`.
    ///
    /// Returns when the respawn is due, or `None` once the slot has used up
    /// its restarts under `policy`.
    pub fn schedule_restart(
        &mut self,
        index: usize,
        uptime: Duration,
        policy: &RestartPolicy,
        now: Instant,
    ) -> Option<Instant> {
        self.restarts
            .entry(index)
            .or_default()
            .schedule(policy, uptime, now)
    }

    /// Slots whose respawn is due at `now`, in index order. Each is handed
    /// out once.
    pub fn take_due_restarts(&mut self, now: Instant) -> Vec<usize> {
        self.restarts
            .iter_mut()
            .filter_map(|(index, state)| state.take_due(now).then_some(*index))
            .collect()
    }

    /// Respawns scheduled for slot `index` in its current streak.
    pub fn restart_attempts(&self, index: usize) -> usize {
        self.restarts.get(&index).map_or(0, RestartState::attempts)
    }

    /// Earliest pending respawn, if any.
    pub fn next_restart(&self) -> Option<Instant> {
        self.restarts.values().filter_map(RestartState::due).min()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Pids ordered by worker index.
    pub fn pids(&self) -> Vec<Pid> {
        let mut workers: Vec<&WorkerHandle> = self.workers.iter().collect();
        workers.sort_by_key(|w| w.index);
        workers.into_iter().map(|w| w.pid).collect()
    }

    /// Pids keyed by worker index. Indexes whose worker is gone are absent.
    pub fn pids_by_index(&self) -> BTreeMap<usize, Pid> {
        self.workers.iter().map(|w| (w.index, w.pid)).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
