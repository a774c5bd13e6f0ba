//! Tests for socket creation, reuse and teardown.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixDatagram, UnixListener};

use proptest::prelude::*;
use tempfile::TempDir;

use super::*;
use crate::error::Error;

fn tcp_key(addr: &str) -> SocketKey {
    SocketKey::parse(Transport::Tcp, addr).unwrap()
}

fn unix_key(dir: &TempDir, name: &str) -> SocketKey {
    SocketKey::new(Transport::Unix, ListenAddr::Unix(dir.path().join(name)))
}

#[test]
fn test_get_or_create_binds_new_socket() {
    let mut registry = SocketRegistry::default();
    let key = tcp_key("127.0.0.1:0");

    let handle = registry.get_or_create(&key, None).unwrap();
    assert!(!handle.is_inherited());
    assert_ne!(handle.local_addr().unwrap().port(), 0);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_get_or_create_is_stable_within_registry() {
    let mut registry = SocketRegistry::default();
    let key = tcp_key("127.0.0.1:0");

    let first = registry.get_or_create(&key, None).unwrap().as_raw_fd();
    let second = registry.get_or_create(&key, None).unwrap().as_raw_fd();
    assert_eq!(first, second);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_reuse_moves_socket_from_predecessor() {
    let mut old = SocketRegistry::default();
    let key = tcp_key("127.0.0.1:0");
    let (old_fd, old_addr) = {
        let handle = old.get_or_create(&key, None).unwrap();
        (handle.as_raw_fd(), handle.local_addr())
    };

    let mut new = SocketRegistry::default();
    let handle = new.get_or_create(&key, Some(&mut old)).unwrap();

    assert_eq!(handle.as_raw_fd(), old_fd);
    assert_eq!(handle.local_addr(), old_addr);
    assert!(handle.is_inherited());
    assert!(!old.contains(&key));
    assert!(new.contains(&key));
}

#[test]
fn test_reused_socket_keeps_accepting() {
    let mut old = SocketRegistry::default();
    let key = tcp_key("127.0.0.1:0");
    let addr = old.get_or_create(&key, None).unwrap().local_addr().unwrap();

    let mut new = SocketRegistry::default();
    new.get_or_create(&key, Some(&mut old)).unwrap();

    // Tearing down the old registry must not touch the claimed socket.
    let report = old.close_unclaimed();
    assert_eq!(report.closed, 0);
    assert!(std::net::TcpStream::connect(addr).is_ok());
}

#[test]
fn test_bind_error_when_address_in_use() {
    let foreign = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = foreign.local_addr().unwrap();

    let mut registry = SocketRegistry::default();
    let key = tcp_key(&addr.to_string());
    let err = registry.get_or_create(&key, None).unwrap_err();

    assert!(matches!(err, Error::Bind { .. }));
    assert!(registry.is_empty());
}

#[test]
fn test_udp_socket_binds_without_listen() {
    let mut registry = SocketRegistry::default();
    let key = SocketKey::parse(Transport::Udp, "127.0.0.1:0").unwrap();

    let handle = registry.get_or_create(&key, None).unwrap();
    assert_ne!(handle.local_addr().unwrap().port(), 0);
}

#[test]
fn test_close_unclaimed_is_idempotent() {
    let mut registry = SocketRegistry::default();
    registry.get_or_create(&tcp_key("127.0.0.1:0"), None).unwrap();

    let first = registry.close_unclaimed();
    assert_eq!(first.closed, 1);
    assert!(first.is_clean());

    let second = registry.close_unclaimed();
    assert_eq!(second.closed, 0);
    assert!(second.is_clean());
}

#[test]
fn test_restore_inherited_returns_only_claimed_sockets() {
    let mut old = SocketRegistry::default();
    let shared = tcp_key("127.0.0.1:0");
    old.get_or_create(&shared, None).unwrap();

    let mut new = SocketRegistry::default();
    new.get_or_create(&shared, Some(&mut old)).unwrap();
    new.get_or_create(&SocketKey::parse(Transport::Udp, "127.0.0.1:0").unwrap(), None)
        .unwrap();

    assert_eq!(new.restore_inherited(&mut old), 1);
    assert!(old.contains(&shared));
    assert!(!old.get(&shared).unwrap().is_inherited());
    assert!(!new.contains(&shared));
    assert_eq!(new.len(), 1);
}

#[test]
fn test_raw_fds_except() {
    let mut registry = SocketRegistry::default();
    let a = tcp_key("127.0.0.1:0");
    let b = SocketKey::parse(Transport::Udp, "127.0.0.1:0").unwrap();
    let fd_a = registry.get_or_create(&a, None).unwrap().as_raw_fd();
    let fd_b = registry.get_or_create(&b, None).unwrap().as_raw_fd();

    assert_eq!(registry.raw_fds_except(&a), vec![fd_b]);
    assert_eq!(registry.raw_fds_except(&b), vec![fd_a]);
    assert_eq!(registry.raw_fds().len(), 2);
}

#[test]
fn test_unix_socket_unlinked_on_close() {
    let dir = TempDir::new().unwrap();
    let key = unix_key(&dir, "app.sock");
    let path = key.unix_path().unwrap().to_path_buf();

    let mut registry = SocketRegistry::default();
    registry.get_or_create(&key, None).unwrap();
    assert!(path.exists());

    let report = registry.close_unclaimed();
    assert!(report.is_clean());
    assert!(!path.exists());
}

#[test]
fn test_unix_stale_socket_file_is_replaced() {
    let dir = TempDir::new().unwrap();
    let key = unix_key(&dir, "stale.sock");
    let path = key.unix_path().unwrap().to_path_buf();

    // Bind then drop: the file stays behind with nobody accepting.
    drop(UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let mut registry = SocketRegistry::default();
    assert!(registry.get_or_create(&key, None).is_ok());
}

#[test]
fn test_unix_live_socket_is_bind_error() {
    let dir = TempDir::new().unwrap();
    let key = unix_key(&dir, "live.sock");
    let _foreign = UnixListener::bind(key.unix_path().unwrap()).unwrap();

    let mut registry = SocketRegistry::default();
    let err = registry.get_or_create(&key, None).unwrap_err();
    assert!(matches!(err, Error::Bind { .. }));
}

#[test]
fn test_unix_datagram_socket_at_path_is_not_removed() {
    let dir = TempDir::new().unwrap();
    let key = unix_key(&dir, "dgram.sock");
    let path = key.unix_path().unwrap().to_path_buf();
    let foreign = UnixDatagram::bind(&path).unwrap();

    let mut registry = SocketRegistry::default();
    let err = registry.get_or_create(&key, None).unwrap_err();
    assert!(matches!(err, Error::Bind { .. }));
    assert!(path.exists());

    let client = UnixDatagram::unbound().unwrap();
    client.send_to(b"ping", &path).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(foreign.recv(&mut buf).unwrap(), 4);
}

#[test]
fn test_unix_path_that_is_not_a_socket_is_bind_error() {
    let dir = TempDir::new().unwrap();
    let key = unix_key(&dir, "regular-file");
    std::fs::write(key.unix_path().unwrap(), b"data").unwrap();

    let mut registry = SocketRegistry::default();
    assert!(matches!(
        registry.get_or_create(&key, None),
        Err(Error::Bind { .. })
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Across any sequence of reloads, a key lives in exactly one of the
    /// predecessor and successor registries, and reused keys keep their fd.
    #[test]
    fn prop_socket_ownership_is_exclusive(
        topologies in prop::collection::vec(prop::collection::btree_set(0usize..4, 0..4), 1..6)
    ) {
        let dir = TempDir::new().unwrap();
        let keys: Vec<SocketKey> = (0..4)
            .map(|i| unix_key(&dir, &format!("s{i}.sock")))
            .collect();

        let mut current = SocketRegistry::default();
        let mut live: BTreeSet<usize> = BTreeSet::new();

        for topology in topologies {
            let mut next = SocketRegistry::default();
            for &i in &topology {
                let old_fd = current.get(&keys[i]).map(AsRawFd::as_raw_fd);
                let handle = next.get_or_create(&keys[i], Some(&mut current)).unwrap();
                if let Some(fd) = old_fd {
                    prop_assert_eq!(handle.as_raw_fd(), fd);
                    prop_assert!(handle.is_inherited());
                }
            }

            for key in next.keys() {
                prop_assert!(!current.contains(key));
            }

            let report = current.close_unclaimed();
            prop_assert!(report.is_clean());
            let dropped: BTreeSet<usize> = live.difference(&topology).copied().collect();
            prop_assert_eq!(report.closed, dropped.len());

            current = next;
            live = topology;
        }
    }
}
