//! Owned listening socket tagged with its registry key.

use socket2::{Domain, SockAddr, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::debug;

use super::key::{ListenAddr, SocketKey};
use crate::error::{Error, Result, TeardownError};

/// A bound (and, for stream transports, listening) socket.
///
/// Handles are moved between registries on reload and never cloned, so a
/// descriptor has exactly one owner in the supervisor.
#[derive(Debug)]
pub struct SocketHandle {
    key: SocketKey,
    socket: Socket,
    local_addr: Option<SocketAddr>,
    inherited: bool,
}

impl SocketHandle {
    /// Create, bind and (for stream transports) listen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] when the address cannot be bound, including
    /// when a live foreign process is accepting on a Unix socket path.
    pub fn open(key: SocketKey, backlog: i32) -> Result<Self> {
        let ty = if key.transport.is_stream() {
            Type::STREAM
        } else {
            Type::DGRAM
        };

        let (socket, addr) = match &key.address {
            ListenAddr::Inet(addr) => {
                let socket = Socket::new(Domain::for_address(*addr), ty, None)
                    .map_err(|e| Error::io(format!("creating socket for {key}"), e))?;
                socket
                    .set_reuse_address(true)
                    .map_err(|e| Error::io(format!("setting SO_REUSEADDR on {key}"), e))?;
                (socket, SockAddr::from(*addr))
            },
            ListenAddr::Unix(path) => {
                clear_stale_unix_path(&key, path)?;
                let socket = Socket::new(Domain::UNIX, ty, None)
                    .map_err(|e| Error::io(format!("creating socket for {key}"), e))?;
                let addr = SockAddr::unix(path)
                    .map_err(|e| Error::io(format!("socket path {}", path.display()), e))?;
                (socket, addr)
            },
        };

        socket.bind(&addr).map_err(|e| Error::bind(key.clone(), e))?;
        if key.transport.is_stream() {
            socket.listen(backlog).map_err(|e| Error::bind(key.clone(), e))?;
        }

        let local_addr = socket.local_addr().ok().and_then(|a| a.as_socket());
        debug!(socket = %key, fd = socket.as_raw_fd(), "Socket bound");

        Ok(Self {
            key,
            socket,
            local_addr,
            inherited: false,
        })
    }

    pub fn key(&self) -> &SocketKey {
        &self.key
    }

    /// Address the kernel actually bound (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether this handle was claimed from a predecessor registry.
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    pub(crate) fn set_inherited(&mut self, inherited: bool) {
        self.inherited = inherited;
    }

    /// Duplicate the descriptor for a worker server.
    ///
    /// # Errors
    ///
    /// Returns the `dup` failure.
    pub fn try_clone_socket(&self) -> io::Result<Socket> {
        self.socket.try_clone()
    }

    /// Close the descriptor and unlink Unix-domain paths.
    ///
    /// Both steps are attempted; failures are returned, not raised.
    pub(crate) fn close(self) -> Vec<TeardownError> {
        let mut errors = Vec::new();
        let key = self.key;

        if let Err(source) = nix::unistd::close(self.socket.into_raw_fd()) {
            errors.push(TeardownError::Close {
                key: key.clone(),
                source,
            });
        }

        if let Some(path) = key.unix_path()
            && let Err(source) = std::fs::remove_file(path)
            && source.kind() != io::ErrorKind::NotFound
        {
            errors.push(TeardownError::Unlink {
                key: key.clone(),
                source,
            });
        }

        debug!(socket = %key, "Socket closed");
        errors
    }
}

impl AsRawFd for SocketHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Remove a leftover socket file nobody is accepting on.
///
/// Only a refused connection marks the file as stale. A live listener, a
/// socket of another type or a path that is not a socket is in use.
fn clear_stale_unix_path(key: &SocketKey, path: &Path) -> Result<()> {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return Ok(());
    };

    if !metadata.file_type().is_socket() {
        return Err(Error::bind(
            key.clone(),
            io::Error::new(io::ErrorKind::AddrInUse, "path exists and is not a socket"),
        ));
    }

    match UnixStream::connect(path) {
        Ok(_) => Err(Error::bind(
            key.clone(),
            io::Error::from(io::ErrorKind::AddrInUse),
        )),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            debug!(path = %path.display(), "Removing stale socket file");
            match std::fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::io(
                    format!("removing stale socket {}", path.display()),
                    e,
                )),
                _ => Ok(()),
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::bind(key.clone(), e)),
    }
}
