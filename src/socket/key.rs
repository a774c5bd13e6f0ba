//! Socket identity: transport plus listen address.

use serde::Deserialize;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Transport a service listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Unix,
}

impl Transport {
    /// Stream transports are put into listening state after bind.
    #[must_use]
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Tcp | Self::Unix)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved address a socket binds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Registry key for a listening socket.
///
/// Two sockets with equal keys are interchangeable across a reload: the new
/// generation inherits the old descriptor instead of binding again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketKey {
    pub transport: Transport,
    pub address: ListenAddr,
}

impl SocketKey {
    pub fn new(transport: Transport, address: ListenAddr) -> Self {
        Self { transport, address }
    }

    /// Parse a configured address for the given transport.
    ///
    /// Inet transports accept `host:port`; host names are resolved and the
    /// first result is used. Unix transports take a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address is empty, unresolvable, or
    /// the wrong shape for the transport.
    pub fn parse(transport: Transport, address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::Config(format!("{transport} address cannot be empty")));
        }

        let address = match transport {
            Transport::Unix => ListenAddr::Unix(PathBuf::from(address)),
            Transport::Tcp | Transport::Udp => {
                if let Ok(addr) = address.parse::<SocketAddr>() {
                    ListenAddr::Inet(addr)
                } else {
                    let resolved = address
                        .to_socket_addrs()
                        .map_err(|e| {
                            Error::Config(format!("invalid {transport} address '{address}': {e}"))
                        })?
                        .next()
                        .ok_or_else(|| {
                            Error::Config(format!("address '{address}' did not resolve"))
                        })?;
                    ListenAddr::Inet(resolved)
                }
            },
        };

        Ok(Self { transport, address })
    }

    /// Filesystem path for Unix-domain keys.
    #[must_use]
    pub fn unix_path(&self) -> Option<&std::path::Path> {
        match &self.address {
            ListenAddr::Unix(path) => Some(path),
            ListenAddr::Inet(_) => None,
        }
    }
}

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inet() {
        let key = SocketKey::parse(Transport::Tcp, "0.0.0.0:8080").unwrap();
        assert_eq!(key.to_string(), "tcp://0.0.0.0:8080");
        assert!(key.unix_path().is_none());
    }

    #[test]
    fn test_parse_unix() {
        let key = SocketKey::parse(Transport::Unix, "/tmp/app.sock").unwrap();
        assert_eq!(key.unix_path().unwrap(), std::path::Path::new("/tmp/app.sock"));
        assert_eq!(key.to_string(), "unix:///tmp/app.sock");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SocketKey::parse(Transport::Tcp, "").is_err());
        assert!(SocketKey::parse(Transport::Udp, "not an address").is_err());
    }

    #[test]
    fn test_same_address_different_transport_is_distinct() {
        let tcp = SocketKey::parse(Transport::Tcp, "127.0.0.1:9000").unwrap();
        let udp = SocketKey::parse(Transport::Udp, "127.0.0.1:9000").unwrap();
        assert_ne!(tcp, udp);
    }
}
