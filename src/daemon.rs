//! Detaching from the terminal and pidfile handling.
//!
//! [`daemonize`] must run before any socket is bound or thread started: the
//! calling process exits and only the detached child returns.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{ForkResult, Pid, chdir, dup2, fork, setsid};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::paths::read_pid;

/// Detach from the controlling terminal.
///
/// Forks (the parent exits 0), starts a new session, changes to `/` and
/// points stdin at `/dev/null` and stdout/stderr at `log` (appended) or
/// `/dev/null`.
///
/// # Errors
///
/// Returns [`Error::Daemon`] if any step fails in the child.
pub fn daemonize(log: Option<&Path>) -> Result<()> {
    // Open the log before forking so a bad path fails in the foreground.
    let output = match log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::io(format!("opening log {}", path.display()), e))?
        },
        None => dev_null(true)?,
    };
    let input = dev_null(false)?;

    // SAFETY: called before the supervisor starts any thread.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {},
        Err(errno) => return Err(Error::Daemon(format!("fork failed: {errno}"))),
    }

    setsid().map_err(|e| Error::Daemon(format!("setsid failed: {e}")))?;
    chdir("/").map_err(|e| Error::Daemon(format!("chdir / failed: {e}")))?;

    let redirects = [
        (input.as_raw_fd(), io::stdin().as_raw_fd()),
        (output.as_raw_fd(), io::stdout().as_raw_fd()),
        (output.as_raw_fd(), io::stderr().as_raw_fd()),
    ];
    for (from, to) in redirects {
        dup2(from, to).map_err(|e| Error::Daemon(format!("redirecting fd {to} failed: {e}")))?;
    }

    Ok(())
}

fn dev_null(write: bool) -> Result<File> {
    OpenOptions::new()
        .read(!write)
        .write(write)
        .open("/dev/null")
        .map_err(|e| Error::io("opening /dev/null", e))
}

/// Whether `pid` names a running process.
pub fn is_running(pid: Pid) -> bool {
    // EPERM: the process exists but belongs to someone else.
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}

/// Send `signal` to the process recorded in `path`.
///
/// # Errors
///
/// Returns [`Error::Daemon`] if the pidfile is missing or unreadable, or the
/// process cannot be signalled.
pub fn signal_pidfile(path: &Path, signal: Signal) -> Result<Pid> {
    let pid = read_pid(path)
        .ok_or_else(|| Error::Daemon(format!("no pid in {}", path.display())))?;
    kill(pid, signal).map_err(|e| Error::Daemon(format!("cannot signal {pid}: {e}")))?;
    Ok(pid)
}

/// Pidfile owned by the running supervisor.
///
/// Removed by [`PidFile::remove`] or on drop, but only by the process that
/// created it: forked children never delete it.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    owner: Pid,
    removed: bool,
}

impl PidFile {
    /// Write the current pid to `path`.
    ///
    /// A stale pidfile (its process is gone) is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Daemon`] if the file names a live process, or
    /// [`Error::Io`] if it cannot be written.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let owner = Pid::this();

        if let Some(existing) = read_pid(&path) {
            if existing != owner && is_running(existing) {
                return Err(Error::Daemon(format!(
                    "{} names running process {existing}",
                    path.display()
                )));
            }
            warn!(path = %path.display(), pid = %existing, "Replacing stale pidfile");
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }
        fs::write(&path, format!("{owner}\n"))
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;

        debug!(path = %path.display(), pid = %owner, "Pidfile written");
        Ok(Self {
            path,
            owner,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the pidfile. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file exists but cannot be removed.
    pub fn remove(&mut self) -> Result<()> {
        if self.removed || Pid::this() != self.owner {
            return Ok(());
        }
        self.removed = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("removing {}", self.path.display()), e)),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(error = %e, "Failed to remove pidfile");
        }
    }
}
