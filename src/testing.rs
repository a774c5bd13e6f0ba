//! In-memory [`ProcessControl`] for lifecycle tests.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::process::{ExitState, ProcessControl, WorkerLaunch};
use crate::socket::SocketKey;

/// What the fake was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Spawn {
        pid: Pid,
        service: String,
        index: usize,
        generation: u64,
        socket_fd: RawFd,
        socket: SocketKey,
        foreign_fds: Vec<RawFd>,
        predecessor: Option<Pid>,
    },
    Signal {
        pid: Pid,
        signal: Signal,
    },
    Reap {
        pid: Pid,
    },
}

/// Records every operation and hands out fake pids.
#[derive(Debug)]
pub struct RecordingProcess {
    pub next_pid: i32,
    pub events: Vec<Event>,
    /// Processes that are alive: forked, not yet reaped.
    pub live: HashSet<Pid>,
    /// Fail the spawn with this ordinal (0-based, counted across the run).
    pub fail_spawn_at: Option<usize>,
    /// Pids that report `ESRCH` when signalled.
    pub vanished: HashSet<Pid>,
    /// Pids whose reap fails with the given errno.
    pub reap_errors: HashMap<Pid, Errno>,
    /// Pids that have exited and can be collected by `try_reap`.
    pub exited: HashMap<Pid, ExitState>,
    pub spawns: usize,
}

impl Default for RecordingProcess {
    fn default() -> Self {
        Self {
            next_pid: 1000,
            events: Vec::new(),
            live: HashSet::new(),
            fail_spawn_at: None,
            vanished: HashSet::new(),
            reap_errors: HashMap::new(),
            exited: HashMap::new(),
            spawns: 0,
        }
    }
}

impl RecordingProcess {
    pub fn spawned(&self) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Spawn { .. }))
            .collect()
    }

    pub fn signalled(&self) -> Vec<Pid> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Signal { pid, .. } => Some(*pid),
                _ => None,
            })
            .collect()
    }

    pub fn reaped(&self) -> Vec<Pid> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Reap { pid } => Some(*pid),
                _ => None,
            })
            .collect()
    }

    /// Mark a live worker as having exited on its own.
    pub fn exit(&mut self, pid: Pid, state: ExitState) {
        self.exited.insert(pid, state);
    }
}

impl ProcessControl for RecordingProcess {
    fn spawn_worker(&mut self, launch: &WorkerLaunch<'_>) -> Result<Pid> {
        let ordinal = self.spawns;
        self.spawns += 1;
        if self.fail_spawn_at == Some(ordinal) {
            return Err(Error::worker_spawn(launch.service, launch.index, Errno::EAGAIN));
        }

        self.next_pid += 1;
        let pid = Pid::from_raw(self.next_pid);
        self.live.insert(pid);
        self.events.push(Event::Spawn {
            pid,
            service: launch.service.to_string(),
            index: launch.index,
            generation: launch.generation.get(),
            socket_fd: std::os::fd::AsRawFd::as_raw_fd(launch.socket),
            socket: launch.socket.key().clone(),
            foreign_fds: launch.foreign_fds.to_vec(),
            predecessor: launch.predecessor,
        });
        Ok(pid)
    }

    fn send_signal(&mut self, pid: Pid, signal: Signal) -> nix::Result<()> {
        self.events.push(Event::Signal { pid, signal });
        if self.vanished.contains(&pid) || !self.live.contains(&pid) {
            return Err(Errno::ESRCH);
        }
        Ok(())
    }

    fn reap(&mut self, pid: Pid) -> nix::Result<ExitState> {
        self.events.push(Event::Reap { pid });
        if let Some(errno) = self.reap_errors.get(&pid) {
            return Err(*errno);
        }
        if self.live.remove(&pid) {
            Ok(ExitState::Signaled(Signal::SIGINT))
        } else {
            Ok(ExitState::Unknown)
        }
    }

    fn try_reap(&mut self, pid: Pid) -> nix::Result<Option<ExitState>> {
        match self.exited.remove(&pid) {
            Some(state) => {
                self.live.remove(&pid);
                Ok(Some(state))
            },
            None => Ok(None),
        }
    }
}
