//! One complete server topology: sockets plus worker groups.
//!
//! A generation is built in two phases. [`Generation::build`] binds or
//! inherits every socket of the topology; only after that succeeds does
//! [`Generation::spawn_workers`] fork anything, so a bind failure never
//! leaves part of a generation running.
//!
//! A generation refers to its predecessor only by [`GenerationId`]. The
//! predecessor is passed in explicitly where it matters (socket reuse,
//! predecessor pid hints, rollback) and is retired and dropped by the
//! supervisor once the successor is serving.

use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ConfigMap;
use crate::error::{Result, TeardownReport};
use crate::process::ProcessControl;
use crate::socket::{SocketHandle, SocketKey, SocketRegistry};
use crate::worker::{RestartPolicy, WorkerGroup, WorkerHandle};


/// Monotonic generation number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(u64);

impl GenerationId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sockets and workers for one configuration.
#[derive(Debug)]
pub struct Generation {
    id: GenerationId,
    predecessor: Option<GenerationId>,
    services: ConfigMap,
    keys: BTreeMap<String, SocketKey>,
    registry: SocketRegistry,
    groups: BTreeMap<String, WorkerGroup>,
    retired: bool,
}

impl Generation {
    /// Bind or inherit every socket of `services`. No worker is spawned.
    ///
    /// Sockets whose key the predecessor holds are moved out of the
    /// predecessor's registry. If any service fails, those sockets are moved
    /// back, sockets bound so far are closed, and the error is returned with
    /// the predecessor exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Bind`] or [`crate::Error::Config`] for the
    /// first service that cannot get a socket.
    pub fn build(
        id: GenerationId,
        services: ConfigMap,
        backlog: i32,
        mut predecessor: Option<&mut Generation>,
    ) -> Result<Self> {
        let mut registry = SocketRegistry::new(backlog);
        let mut keys = BTreeMap::new();

        for (name, service) in &services {
            let claimed = service.socket_key().and_then(|key| {
                registry.get_or_create(&key, predecessor.as_deref_mut().map(|p| &mut p.registry))?;
                Ok(key)
            });

            match claimed {
                Ok(key) => {
                    keys.insert(name.clone(), key);
                },
                Err(e) => {
                    error!(generation = %id, service = %name, error = %e, "Generation build failed");
                    if let Some(previous) = predecessor.as_deref_mut() {
                        registry.restore_inherited(&mut previous.registry);
                    }
                    registry.close_unclaimed().log_errors();
                    return Err(e);
                },
            }
        }

        let groups = services
            .iter()
            .map(|(name, service)| (name.clone(), WorkerGroup::new(id, name.clone(), service.clone())))
            .collect();

        info!(generation = %id, services = services.len(), sockets = registry.len(), "Generation built");

        Ok(Self {
            id,
            predecessor: predecessor.map(|p| p.id),
            services,
            keys,
            registry,
            groups,
            retired: false,
        })
    }

    /// Fork the workers of every service.
    ///
    /// Each worker closes the sockets of every other service, including
    /// sockets the predecessor still holds, and is told the pid of the
    /// predecessor's worker at the same index for the same service name.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::WorkerSpawn`] if a fork fails. The caller
    /// should [`abandon`](Self::abandon) the generation.
    pub fn spawn_workers(
        &mut self,
        process: &mut dyn ProcessControl,
        predecessor: Option<&Generation>,
    ) -> Result<()> {
        let inherited_fds = predecessor.map(|p| p.registry.raw_fds()).unwrap_or_default();

        for (name, group) in &mut self.groups {
            let key = &self.keys[name];
            let Some(socket) = self.registry.get(key) else {
                continue;
            };

            let mut foreign_fds = self.registry.raw_fds_except(key);
            foreign_fds.extend_from_slice(&inherited_fds);

            let predecessor_pids = predecessor
                .and_then(|p| p.groups.get(name))
                .map(WorkerGroup::pids_by_index)
                .unwrap_or_default();

            let count = group.config().workers;
            group.spawn(process, count, socket, &foreign_fds, &predecessor_pids)?;
        }

        info!(generation = %self.id, workers = self.worker_count(), "Generation spawned");
        Ok(())
    }

    /// Interrupt every worker, reap them all, then close sockets no
    /// successor claimed.
    ///
    /// Every signal is sent before the first wait. Failures are collected
    /// and the remaining steps still run. Calling this again is harmless.
    pub fn retire(&mut self, process: &mut dyn ProcessControl) -> TeardownReport {
        let mut report = TeardownReport::default();

        for group in self.groups.values() {
            report.merge(group.kill_all(process, Signal::SIGINT));
        }
        for group in self.groups.values_mut() {
            report.merge(group.wait_all(process));
        }
        report.merge(self.registry.close_unclaimed());

        if !self.retired || report.signalled + report.reaped + report.closed > 0 {
            info!(
                generation = %self.id,
                signalled = report.signalled,
                reaped = report.reaped,
                closed = report.closed,
                errors = report.errors.len(),
                "Generation retired"
            );
        }
        report.log_errors();
        self.retired = true;
        report
    }

    /// Tear down a generation that never went live.
    ///
    /// Inherited sockets are handed back to `predecessor` first so the
    /// generation that is still serving keeps them.
    pub fn abandon(
        &mut self,
        process: &mut dyn ProcessControl,
        predecessor: Option<&mut Generation>,
    ) -> TeardownReport {
        if let Some(previous) = predecessor {
            let restored = self.registry.restore_inherited(&mut previous.registry);
            warn!(generation = %self.id, restored, "Abandoning generation");
        }
        self.retire(process)
    }

    /// Reap workers that exited on their own.
    ///
    /// With a `policy`, each exited slot is scheduled for respawn after its
    /// backoff delay and slots already due at `now` are respawned. A slot
    /// past its restart limit is left empty.
    ///
    /// Returns the handles of the workers that exited.
    pub fn reap_exited(
        &mut self,
        process: &mut dyn ProcessControl,
        policy: Option<&RestartPolicy>,
        now: Instant,
    ) -> Vec<WorkerHandle> {
        let mut exited = Vec::new();

        for (name, group) in &mut self.groups {
            for (worker, state) in group.reap_exited(process) {
                warn!(
                    generation = %self.id,
                    service = %name,
                    worker = worker.index,
                    pid = %worker.pid,
                    state = ?state,
                    "Worker exited unexpectedly"
                );

                if let Some(policy) = policy {
                    let uptime = now.saturating_duration_since(worker.started_at);
                    match group.schedule_restart(worker.index, uptime, policy, now) {
                        Some(due) => debug!(
                            service = %name,
                            worker = worker.index,
                            attempt = group.restart_attempts(worker.index),
                            delay_ms = due.saturating_duration_since(now).as_millis() as u64,
                            "Worker respawn scheduled"
                        ),
                        None => error!(
                            service = %name,
                            worker = worker.index,
                            max_restarts = policy.max_restarts,
                            "Worker keeps exiting, not respawning it"
                        ),
                    }
                }
                exited.push(worker);
            }
        }

        if policy.is_some() {
            self.respawn_due(process, now);
        }
        exited
    }

    /// Fork replacements for every slot whose respawn is due at `now`.
    ///
    /// A failed fork is logged and the slot is not retried.
    ///
    /// Returns the number of workers forked.
    pub fn respawn_due(&mut self, process: &mut dyn ProcessControl, now: Instant) -> usize {
        let mut respawned = 0;

        for (name, group) in &mut self.groups {
            let due = group.take_due_restarts(now);
            if due.is_empty() {
                continue;
            }

            let key = &self.keys[name];
            let Some(socket) = self.registry.get(key) else {
                continue;
            };
            let foreign_fds = self.registry.raw_fds_except(key);

            for index in due {
                match group.spawn_one(process, index, socket, &foreign_fds, None) {
                    Ok(pid) => {
                        respawned += 1;
                        info!(
                            service = %name,
                            worker = index,
                            pid = %pid,
                            attempt = group.restart_attempts(index),
                            "Worker respawned"
                        );
                    },
                    Err(e) => error!(service = %name, worker = index, error = %e, "Worker respawn failed"),
                }
            }
        }

        respawned
    }

    /// Earliest pending respawn across all services.
    pub fn next_restart(&self) -> Option<Instant> {
        self.groups.values().filter_map(WorkerGroup::next_restart).min()
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    /// Id of the generation this one replaced.
    pub fn predecessor(&self) -> Option<GenerationId> {
        self.predecessor
    }

    pub fn services(&self) -> &ConfigMap {
        &self.services
    }

    pub fn registry(&self) -> &SocketRegistry {
        &self.registry
    }

    pub fn group(&self, service: &str) -> Option<&WorkerGroup> {
        self.groups.get(service)
    }

    pub fn groups(&self) -> impl Iterator<Item = &WorkerGroup> {
        self.groups.values()
    }

    /// Socket held for `service`, if the service exists.
    pub fn socket(&self, service: &str) -> Option<&SocketHandle> {
        self.keys.get(service).and_then(|key| self.registry.get(key))
    }

    pub fn worker_count(&self) -> usize {
        self.groups.values().map(WorkerGroup::len).sum()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }
}
