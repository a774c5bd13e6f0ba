//! The master process: owns the live generation and sequences its lifecycle.
//!
//! Signals never touch supervisor state directly. Handlers set
//! [`SignalFlags`]; each [`Supervisor::tick`] drains the flags into a FIFO
//! queue of [`DeferredAction`]s and runs them in order.
//!
//! A graceful reload validates the new configuration, builds the successor
//! generation against the current one (inheriting every socket whose key is
//! unchanged), spawns its workers and only then retires the old generation.
//! Any failure before the swap leaves the old generation serving.

mod handle;
mod state;


use std::collections::VecDeque;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigSource, SupervisorSettings, ValidationMode};
use crate::error::{Error, Result, TeardownReport};
use crate::generation::{Generation, GenerationId};
use crate::process::ProcessControl;
use crate::signals::{SignalFlags, SignalRegistration};
use crate::validate::{ConfigValidator, validator_for};
use crate::worker::RestartPolicy;

pub use handle::SupervisorHandle;
pub use state::{DeferredAction, SupervisorState};

/// Master process state.
pub struct Supervisor<P> {
    source: Box<dyn ConfigSource>,
    validator: Box<dyn ConfigValidator>,
    /// Mode `validator` was built for; `None` for a caller-supplied validator.
    validation: Option<ValidationMode>,
    process: P,
    flags: SignalFlags,
    alive: bool,
    state: SupervisorState,
    queue: VecDeque<DeferredAction>,
    current: Option<Generation>,
    next_id: GenerationId,
    settings: SupervisorSettings,
}

impl<P: ProcessControl> Supervisor<P> {
    /// Supervisor with a fixed validator, kept across reloads.
    pub fn new(source: Box<dyn ConfigSource>, validator: Box<dyn ConfigValidator>, process: P) -> Self {
        Self::build(source, validator, None, process)
    }

    /// Supervisor whose validator follows `supervisor.validation`.
    ///
    /// `mode` applies until the first configuration is loaded; after that
    /// each applied configuration picks the validator for the next reload.
    pub fn with_validation(source: Box<dyn ConfigSource>, mode: ValidationMode, process: P) -> Self {
        Self::build(source, validator_for(mode), Some(mode), process)
    }

    fn build(
        source: Box<dyn ConfigSource>,
        validator: Box<dyn ConfigValidator>,
        validation: Option<ValidationMode>,
        process: P,
    ) -> Self {
        Self {
            source,
            validator,
            validation,
            process,
            flags: SignalFlags::new(),
            alive: true,
            state: SupervisorState::Starting,
            queue: VecDeque::new(),
            current: None,
            next_id: GenerationId::new(1),
            settings: SupervisorSettings::default(),
        }
    }

    /// Handle that requests reload or shutdown through the signal flags.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle::new(self.flags.clone())
    }

    /// Route `SIGINT`/`SIGTERM`, `SIGUSR1`/`SIGHUP` and `SIGCHLD` into this
    /// supervisor. Handlers are removed when the guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a handler cannot be installed.
    pub fn install_signal_handlers(&self) -> Result<SignalRegistration> {
        self.flags
            .register()
            .map_err(|e| Error::io("installing signal handlers", e))
    }

    /// Validate and load the configuration, then build and spawn the first
    /// generation.
    ///
    /// # Errors
    ///
    /// Returns the validation, bind or spawn error. Nothing is left running
    /// and the supervisor is `Stopped`.
    pub fn start(&mut self) -> Result<()> {
        self.state = SupervisorState::Starting;
        info!(source = %self.source.describe(), "Starting supervisor");

        match self.start_first_generation() {
            Ok(id) => {
                self.state = SupervisorState::Running;
                info!(generation = %id, workers = self.worker_count(), "Supervisor running");
                Ok(())
            },
            Err(e) => {
                error!(error = %e, "Supervisor failed to start");
                self.alive = false;
                self.state = SupervisorState::Stopped;
                Err(e)
            },
        }
    }

    fn start_first_generation(&mut self) -> Result<GenerationId> {
        let config = load_validated(self.source.as_ref(), self.validator.as_mut())?;
        let id = self.next_id;

        let mut generation = Generation::build(id, config.services, config.supervisor.backlog, None)?;
        if let Err(e) = generation.spawn_workers(&mut self.process, None) {
            generation.abandon(&mut self.process, None);
            return Err(e);
        }

        self.apply_settings(config.supervisor);
        self.current = Some(generation);
        self.next_id = id.next();
        Ok(id)
    }

    /// Adopt the `[supervisor]` table of an applied configuration.
    fn apply_settings(&mut self, settings: SupervisorSettings) {
        if let Some(mode) = self.validation
            && mode != settings.validation
        {
            info!(from = ?mode, to = ?settings.validation, "Switching config validation mode");
            self.validator = validator_for(settings.validation);
            self.validation = Some(settings.validation);
        }
        self.settings = settings;
    }

    /// Drain pending signals into the action queue, then run queued actions
    /// in arrival order.
    pub fn tick(&mut self) {
        self.drain_signals();

        while let Some(action) = self.queue.pop_front() {
            if !self.alive {
                debug!(dropped = self.queue.len() + 1, "Shutting down, dropping queued actions");
                self.queue.clear();
                break;
            }
            match action {
                DeferredAction::GracefulReload => self.graceful_reload(),
                DeferredAction::ReapWorkers => self.reap_workers(),
            }
        }

        if self.alive && self.settings.respawn {
            self.respawn_due();
        }
    }

    fn drain_signals(&mut self) {
        if self.flags.shutdown_requested() && self.alive {
            info!("Shutdown requested");
            self.alive = false;
        }
        if self.flags.take_child_exited() {
            self.enqueue(DeferredAction::ReapWorkers);
        }
        if self.flags.take_reload() {
            info!("Reload requested");
            self.enqueue(DeferredAction::GracefulReload);
        }
    }

    /// Queue an action unless the same action is already waiting.
    pub fn enqueue(&mut self, action: DeferredAction) {
        if !self.queue.contains(&action) {
            self.queue.push_back(action);
        }
    }

    /// Replace the current generation with one built from freshly loaded
    /// configuration. Failures are logged and leave the current generation
    /// serving.
    pub fn graceful_reload(&mut self) {
        if !self.state.accepts_reload() {
            warn!(state = %self.state, "Ignoring reload");
            return;
        }

        self.state = SupervisorState::Reloading;
        match self.replace_generation() {
            Ok(report) => {
                info!(
                    generation = ?self.current_id(),
                    workers = self.worker_count(),
                    teardown_errors = report.errors.len(),
                    "Reload complete"
                );
            },
            Err(e) => {
                error!(
                    generation = ?self.current_id(),
                    error = %e,
                    "Reload aborted, keeping current generation"
                );
            },
        }
        self.state = SupervisorState::Running;
    }

    fn replace_generation(&mut self) -> Result<TeardownReport> {
        let config = load_validated(self.source.as_ref(), self.validator.as_mut())?;
        let Some(current) = self.current.as_mut() else {
            return Err(Error::Config("no generation is running".to_string()));
        };

        let id = self.next_id;
        info!(generation = %id, predecessor = %current.id(), "Building generation");

        let mut next = Generation::build(id, config.services, config.supervisor.backlog, Some(&mut *current))?;
        if let Err(e) = next.spawn_workers(&mut self.process, Some(&*current)) {
            next.abandon(&mut self.process, Some(current));
            return Err(e);
        }

        self.next_id = id.next();
        let mut previous = std::mem::replace(current, next);
        let report = previous.retire(&mut self.process);
        self.apply_settings(config.supervisor);
        Ok(report)
    }

    /// Collect workers that exited on their own.
    ///
    /// With `supervisor.respawn` each one is scheduled for replacement under
    /// the configured backoff; see [`RestartPolicy`].
    pub fn reap_workers(&mut self) {
        let respawn = self.settings.respawn;
        let policy = respawn.then(|| RestartPolicy::from_settings(&self.settings));
        if let Some(current) = self.current.as_mut() {
            let exited = current.reap_exited(&mut self.process, policy.as_ref(), Instant::now());
            if !exited.is_empty() {
                debug!(exited = exited.len(), respawn, "Reaped workers");
            }
        }
    }

    /// Fork replacements whose backoff delay has passed.
    fn respawn_due(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.respawn_due(&mut self.process, Instant::now());
        }
    }

    /// Start, serve until shutdown is requested, then shut down.
    ///
    /// # Errors
    ///
    /// Returns the startup error; once running, failures are logged and the
    /// loop continues.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;

        loop {
            self.tick();
            if !self.alive {
                break;
            }
            thread::sleep(self.settings.poll_interval());
        }

        let report = self.shutdown();
        info!(
            signalled = report.signalled,
            reaped = report.reaped,
            closed = report.closed,
            "Supervisor stopped"
        );
        Ok(())
    }

    /// Retire the current generation. Calling this again is harmless.
    pub fn shutdown(&mut self) -> TeardownReport {
        self.alive = false;
        if self.state == SupervisorState::Stopped {
            return TeardownReport::default();
        }

        self.state = SupervisorState::Stopping;
        let report = match self.current.take() {
            Some(mut generation) => generation.retire(&mut self.process),
            None => TeardownReport::default(),
        };
        self.state = SupervisorState::Stopped;
        report
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn current(&self) -> Option<&Generation> {
        self.current.as_ref()
    }

    pub fn current_id(&self) -> Option<GenerationId> {
        self.current.as_ref().map(Generation::id)
    }

    pub fn worker_count(&self) -> usize {
        self.current.as_ref().map_or(0, Generation::worker_count)
    }

    pub fn pending(&self) -> impl Iterator<Item = &DeferredAction> {
        self.queue.iter()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Validation mode in effect, or `None` for a caller-supplied validator.
    pub fn validation_mode(&self) -> Option<ValidationMode> {
        self.validation
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut P {
        &mut self.process
    }
}

/// Ask the validator first, then load in-process.
fn load_validated(source: &dyn ConfigSource, validator: &mut dyn ConfigValidator) -> Result<Config> {
    validator.validate(source)?;
    let config = source.load()?;
    config.validate()?;
    Ok(config)
}
