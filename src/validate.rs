//! Configuration validation before a reload is applied.
//!
//! The default, [`ForkedValidator`], loads and validates the configuration in
//! a throwaway child so a config that crashes or hangs the loader cannot take
//! the supervisor down with it. Only the child's exit code comes back.
//! [`InProcessValidator`] does the same work in the supervisor itself.

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, error, warn};

use crate::config::{ConfigSource, ValidationMode, ValidationResult};
use crate::error::{Error, Result};

/// Exit code of a validation child that accepted the configuration.
pub const VALIDATION_OK: i32 = 0;

/// Exit code of a validation child that rejected the configuration.
pub const VALIDATION_FAILED: i32 = 1;

/// Decides whether a configuration may be applied.
pub trait ConfigValidator {
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] (or the loader's own error when
    /// validating in-process) if the configuration must not be applied.
    fn validate(&mut self, source: &dyn ConfigSource) -> Result<()>;
}

/// Validator for the configured [`ValidationMode`].
pub fn validator_for(mode: ValidationMode) -> Box<dyn ConfigValidator> {
    match mode {
        ValidationMode::Fork => Box::new(ForkedValidator),
        ValidationMode::InProcess => Box::new(InProcessValidator),
    }
}

/// Load and validate, logging warnings.
fn check(source: &dyn ConfigSource) -> Result<ValidationResult> {
    let result = source.load()?.validate()?;
    for warning in &result.warnings {
        warn!(source = %source.describe(), "{warning}");
    }
    Ok(result)
}

/// Validates in the supervisor process.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessValidator;

impl ConfigValidator for InProcessValidator {
    fn validate(&mut self, source: &dyn ConfigSource) -> Result<()> {
        check(source).map(|_| ())
    }
}

/// Validates in a forked child and reads the verdict from its exit code.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkedValidator;

impl ConfigValidator for ForkedValidator {
    fn validate(&mut self, source: &dyn ConfigSource) -> Result<()> {
        // SAFETY: the supervisor is single-threaded; the child only loads the
        // configuration and leaves through `std::process::exit`.
        let child = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => {
                let code = match catch_unwind(AssertUnwindSafe(|| check(source))) {
                    Ok(Ok(_)) => VALIDATION_OK,
                    Ok(Err(e)) => {
                        error!(source = %source.describe(), error = %e, "Configuration rejected");
                        VALIDATION_FAILED
                    },
                    Err(_) => VALIDATION_FAILED,
                };
                std::process::exit(code)
            },
            Err(errno) => {
                return Err(Error::validation(format!("cannot fork validation child: {errno}")));
            },
        };

        debug!(pid = %child, "Validating configuration in child");

        let status = loop {
            match waitpid(child, None) {
                Ok(status) => break status,
                Err(Errno::EINTR) => {},
                Err(errno) => {
                    return Err(Error::validation(format!(
                        "cannot reap validation child {child}: {errno}"
                    )));
                },
            }
        };

        match status {
            WaitStatus::Exited(_, VALIDATION_OK) => Ok(()),
            WaitStatus::Exited(_, code) => Err(Error::validation(format!(
                "{} rejected (validation exit code {code})",
                source.describe()
            ))),
            WaitStatus::Signaled(_, signal, _) => Err(Error::validation(format!(
                "validation child for {} killed by {signal}",
                source.describe()
            ))),
            other => Err(Error::validation(format!(
                "unexpected validation child status: {other:?}"
            ))),
        }
    }
}
