//! Respawn backoff for workers that exit while their generation is current.
//!
//! Each worker slot (service plus index) keeps its own [`RestartState`]. The
//! delay before the next respawn grows exponentially with consecutive exits
//! and the slot is given up once [`RestartPolicy::max_restarts`] is reached.
//! A worker that stayed up for [`RestartPolicy::reset_after`] starts over.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::{Duration, Instant};

use crate::config::SupervisorSettings;

/// Uptime after which a worker's exit no longer counts as a crash loop.
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(60);

/// Backoff settings for respawning exited workers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    /// Delay before the first respawn.
    pub initial_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    /// Consecutive respawns allowed before the slot is given up.
    pub max_restarts: usize,
    /// Multiplier applied to the delay after each respawn.
    pub factor: f32,
    /// A worker that ran at least this long resets its slot's backoff.
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

impl RestartPolicy {
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.restart_delay_ms),
            max_delay: Duration::from_millis(settings.restart_max_delay_ms),
            max_restarts: settings.max_restarts,
            factor: 2.0,
            reset_after: DEFAULT_RESET_AFTER,
        }
    }

    /// Delay before respawn number `attempt` (zero based), or `None` once
    /// the limit is reached.
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        self.build_backoff().build().nth(attempt)
    }

    // Deterministic delays, no jitter.
    fn build_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_restarts)
            .with_factor(self.factor)
    }
}

/// Respawn bookkeeping for one worker slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartState {
    attempts: usize,
    due: Option<Instant>,
}

impl RestartState {
    /// Record an exit at `now` after `uptime` and schedule the next respawn.
    ///
    /// Returns when the respawn is due, or `None` if the slot has used up
    /// its restarts.
    pub fn schedule(&mut self, policy: &RestartPolicy, uptime: Duration, now: Instant) -> Option<Instant> {
        if uptime >= policy.reset_after {
            self.attempts = 0;
        }
        self.due = policy.delay(self.attempts).map(|delay| now + delay);
        if self.due.is_some() {
            self.attempts += 1;
        }
        self.due
    }

    /// Whether a respawn is due at `now`. A due respawn is consumed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if due <= now => {
                self.due = None;
                true
            },
            _ => false,
        }
    }

    /// Respawns scheduled so far in the current streak.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn due(&self) -> Option<Instant> {
        self.due
    }
}
