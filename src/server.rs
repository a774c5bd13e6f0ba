//! Worker-side socket servers.
//!
//! The supervisor never looks inside a worker. It hands a forked child a
//! [`WorkerContext`] and asks a [`ServerFactory`] for a [`WorkerServer`],
//! then runs [`WorkerServer::serve_forever`] until the process exits.
//!
//! [`EchoServer`] is the built-in implementation used by the `prefork`
//! binary: stream transports echo bytes back per connection, datagram
//! transports echo each packet to its sender.

use anyhow::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use socket2::Socket;
use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::unix::net::UnixListener;
use tracing::{debug, info, warn};

use crate::generation::GenerationId;
use crate::socket::{SocketKey, Transport};

/// Hook that drops connections from non-loopback peers.
pub const HOOK_LOOPBACK_ONLY: &str = "loopback-only";

/// Option that makes a new worker interrupt its predecessor once serving.
pub const OPTION_HANDOFF: &str = "handoff";

/// Everything a worker server is constructed with.
#[derive(Debug)]
pub struct WorkerContext {
    pub generation: GenerationId,
    pub service: String,
    pub index: usize,
    pub key: SocketKey,
    /// The claimed listening socket, duplicated for this worker.
    pub socket: Socket,
    pub hooks: Vec<String>,
    pub options: toml::Table,
    /// Worker of the previous generation at the same index, if any.
    pub predecessor: Option<Pid>,
}

impl WorkerContext {
    pub fn has_hook(&self, hook: &str) -> bool {
        self.hooks.iter().any(|h| h == hook)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.options
            .get(name)
            .and_then(toml::Value::as_bool)
            .unwrap_or(false)
    }
}

/// A server that runs inside one worker process.
pub trait WorkerServer {
    /// Serve on the claimed socket until the process is told to stop.
    ///
    /// # Errors
    ///
    /// Returning an error makes the worker exit with status 1.
    fn serve_forever(&mut self) -> Result<()>;
}

/// Builds a worker server in a freshly forked child.
pub trait ServerFactory {
    /// # Errors
    ///
    /// A construction failure makes the worker exit with status 1; sibling
    /// workers and the supervisor are unaffected.
    fn build(&self, context: WorkerContext) -> Result<Box<dyn WorkerServer>>;
}

/// Factory for [`EchoServer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoServerFactory;

impl ServerFactory for EchoServerFactory {
    fn build(&self, context: WorkerContext) -> Result<Box<dyn WorkerServer>> {
        Ok(Box::new(EchoServer::new(context)?))
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    Udp(UdpSocket),
}

/// Echo server over any supported transport.
pub struct EchoServer {
    service: String,
    index: usize,
    listener: Listener,
    loopback_only: bool,
    handoff_to: Option<Pid>,
}

impl EchoServer {
    /// # Errors
    ///
    /// Fails if the socket cannot be switched to blocking mode.
    pub fn new(context: WorkerContext) -> Result<Self> {
        let loopback_only = context.has_hook(HOOK_LOOPBACK_ONLY);
        let handoff_to = if context.flag(OPTION_HANDOFF) {
            context.predecessor
        } else {
            None
        };

        context
            .socket
            .set_nonblocking(false)
            .context("Failed to set worker socket blocking")?;

        let listener = match context.key.transport {
            Transport::Tcp => Listener::Tcp(context.socket.into()),
            Transport::Unix => Listener::Unix(context.socket.into()),
            Transport::Udp => Listener::Udp(context.socket.into()),
        };

        Ok(Self {
            service: context.service,
            index: context.index,
            listener,
            loopback_only,
            handoff_to,
        })
    }

    fn accepts(&self, peer: Option<SocketAddr>) -> bool {
        !self.loopback_only || peer.is_none_or(|addr| addr.ip().is_loopback())
    }

    fn signal_predecessor(&mut self) {
        let Some(pid) = self.handoff_to.take() else {
            return;
        };

        match kill(pid, Signal::SIGINT) {
            Ok(()) => info!(service = %self.service, predecessor = %pid, "Handed off from predecessor"),
            Err(e) => debug!(service = %self.service, predecessor = %pid, error = %e, "Predecessor already gone"),
        }
    }
}

impl WorkerServer for EchoServer {
    fn serve_forever(&mut self) -> Result<()> {
        info!(service = %self.service, worker = self.index, pid = %std::process::id(), "Worker serving");
        self.signal_predecessor();

        loop {
            let result = match &self.listener {
                Listener::Tcp(listener) => {
                    let (mut stream, peer) = listener.accept().context("accept failed")?;
                    if !self.accepts(Some(peer)) {
                        debug!(peer = %peer, "Rejected by loopback-only hook");
                        continue;
                    }
                    let mut reader = stream.try_clone()?;
                    io::copy(&mut reader, &mut stream).map(drop)
                },
                Listener::Unix(listener) => {
                    let (mut stream, _) = listener.accept().context("accept failed")?;
                    let mut reader = stream.try_clone()?;
                    io::copy(&mut reader, &mut stream).map(drop)
                },
                Listener::Udp(socket) => {
                    let mut buf = [0u8; 65_536];
                    let (len, peer) = socket.recv_from(&mut buf).context("recv failed")?;
                    if !self.accepts(Some(peer)) {
                        continue;
                    }
                    socket.send_to(&buf[..len], peer).map(drop)
                },
            };

            if let Err(e) = result {
                warn!(service = %self.service, error = %e, "Connection error");
            }
        }
    }
}
