//! Configuration types for the supervisor.
//!
//! This module loads and validates the service topology from a TOML file:
//!
//! - [`Config`] - Root configuration struct
//! - [`SupervisorSettings`] - Poll loop, validation and respawn settings
//! - [`ServiceConfig`] - One named service: transport, address, workers
//! - [`ConfigSource`] - Where the supervisor (re)loads configuration from
//!
//! All configuration types support serde deserialization and provide
//! sensible defaults.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::socket::{DEFAULT_BACKLOG, ListenAddr, SocketKey, Transport};

/// Default main-loop poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default delay before the first respawn of an exited worker.
pub const DEFAULT_RESTART_DELAY_MS: u64 = 500;

/// Default ceiling for the respawn delay.
pub const DEFAULT_RESTART_MAX_DELAY_MS: u64 = 30_000;

/// Default number of consecutive respawns before a worker slot is given up.
pub const DEFAULT_MAX_RESTARTS: usize = 5;

/// Worker counts above this produce a warning.
const MAX_SANE_WORKERS: usize = 256;

/// Service name -> service configuration, in a stable order.
pub type ConfigMap = BTreeMap<String, ServiceConfig>;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// prefork.toml configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub services: ConfigMap,
}

/// How a reload checks new configuration before applying it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationMode {
    /// Load and validate in a throwaway child; only the exit code comes back.
    #[default]
    Fork,
    /// Load and validate inside the supervisor process.
    InProcess,
}

/// Settings for the supervisor itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub validation: ValidationMode,
    /// Replace workers that exit while their generation is current.
    #[serde(default)]
    pub respawn: bool,
    /// Delay before the first respawn; doubles for each consecutive exit.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_restart_max_delay_ms")]
    pub restart_max_delay_ms: u64,
    /// Consecutive respawns of one worker slot before giving up on it.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            validation: ValidationMode::default(),
            respawn: false,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            restart_max_delay_ms: DEFAULT_RESTART_MAX_DELAY_MS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            pidfile: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl SupervisorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_restart_delay_ms() -> u64 {
    DEFAULT_RESTART_DELAY_MS
}

fn default_restart_max_delay_ms() -> u64 {
    DEFAULT_RESTART_MAX_DELAY_MS
}

fn default_max_restarts() -> usize {
    DEFAULT_MAX_RESTARTS
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_workers() -> usize {
    1
}

/// Configuration for one named service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub transport: Transport,
    pub address: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Acceptance hooks, interpreted by the worker server.
    #[serde(default)]
    pub hooks: Vec<String>,
    /// Free-form options passed through to the worker server.
    #[serde(default)]
    pub options: toml::Table,
}

impl ServiceConfig {
    pub fn new(transport: Transport, address: impl Into<String>, workers: usize) -> Self {
        Self {
            transport,
            address: address.into(),
            workers,
            hooks: Vec::new(),
            options: toml::Table::new(),
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: impl Into<String>) -> Self {
        self.hooks.push(hook.into());
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Registry key for this service's socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address does not parse.
    pub fn socket_key(&self) -> Result<SocketKey> {
        SocketKey::parse(self.transport, &self.address)
    }

    /// Boolean option lookup; absent or non-boolean values are `false`.
    pub fn flag(&self, name: &str) -> bool {
        self.options
            .get(name)
            .and_then(toml::Value::as_bool)
            .unwrap_or(false)
    }
}

impl Config {
    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - Required fields are missing or have invalid types
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading config file {}", path.display()), e))?;

        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on syntax or shape errors.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration with comprehensive checks.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] listing every problem found:
    /// - No services, or an empty service name
    /// - Zero workers
    /// - Unparseable addresses, or two services sharing one socket key
    /// - Zero poll interval or backlog
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // 1. Supervisor settings
        if self.supervisor.poll_interval_ms == 0 {
            errors.push("supervisor.poll_interval_ms cannot be 0".to_string());
        }
        if self.supervisor.backlog <= 0 {
            errors.push("supervisor.backlog must be positive".to_string());
        }
        if self.supervisor.restart_max_delay_ms < self.supervisor.restart_delay_ms {
            errors.push(
                "supervisor.restart_max_delay_ms cannot be below supervisor.restart_delay_ms"
                    .to_string(),
            );
        }

        // 2. Services
        if self.services.is_empty() {
            errors.push("at least one [services.<name>] table is required".to_string());
        }

        let mut owners: HashMap<SocketKey, &str> = HashMap::new();
        for (name, service) in &self.services {
            if name.trim().is_empty() {
                errors.push("service name cannot be empty".to_string());
            }

            if service.workers == 0 {
                errors.push(format!("service '{name}' must have at least 1 worker"));
            } else if service.workers > MAX_SANE_WORKERS {
                warnings.push(format!(
                    "service '{name}' has {} workers (> {MAX_SANE_WORKERS})\n  \
                     Each worker is a full process; check available memory",
                    service.workers
                ));
            }

            let key = match service.socket_key() {
                Ok(key) => key,
                Err(e) => {
                    errors.push(format!("service '{name}': {e}"));
                    continue;
                },
            };

            match &key.address {
                ListenAddr::Inet(addr) if addr.port() != 0 && addr.port() < 1024 => {
                    warnings.push(format!(
                        "service '{name}' binds privileged port {} (< 1024)",
                        addr.port()
                    ));
                },
                ListenAddr::Unix(path) => {
                    if let Some(parent) = path.parent()
                        && !parent.as_os_str().is_empty()
                        && !parent.is_dir()
                    {
                        errors.push(format!(
                            "service '{name}': socket directory does not exist: {}",
                            parent.display()
                        ));
                    }
                },
                ListenAddr::Inet(_) => {},
            }

            if let Some(other) = owners.insert(key.clone(), name) {
                errors.push(format!(
                    "services '{other}' and '{name}' both bind {key}"
                ));
            }
        }

        if !errors.is_empty() {
            return Err(Error::validation(format!(
                "\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(ValidationResult { warnings })
    }
}

/// Where configuration comes from on startup and on every reload.
pub trait ConfigSource {
    /// Load the current configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or parsed.
    fn load(&self) -> Result<Config>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// A TOML file re-read on every load.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for ConfigFile {
    fn load(&self) -> Result<Config> {
        Config::load_from(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
