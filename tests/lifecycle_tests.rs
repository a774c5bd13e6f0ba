//! End-to-end supervisor lifecycle with real forked echo workers.
//!
//! These tests fork, so they run serially.

use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serial_test::serial;
use tempfile::TempDir;

use prefork::config::{Config, ConfigFile};
use prefork::process::ForkProcess;
use prefork::server::EchoServerFactory;
use prefork::supervisor::{Supervisor, SupervisorState};

const CONFIG: &str = r#"
[supervisor]
poll_interval_ms = 10

[services.echo]
transport = "tcp"
address = "127.0.0.1:0"
workers = 2
"#;

fn supervisor(dir: &TempDir, content: &str) -> Supervisor<ForkProcess<EchoServerFactory>> {
    let path = dir.path().join("prefork.toml");
    fs::write(&path, content).unwrap();
    let config = Config::load_from(&path).unwrap();
    Supervisor::with_validation(
        Box::new(ConfigFile::new(path)),
        config.supervisor.validation,
        ForkProcess::new(EchoServerFactory),
    )
}

fn echo(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(payload).unwrap();
    stream.shutdown(Shutdown::Write).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    reply
}

fn echo_addr(supervisor: &Supervisor<ForkProcess<EchoServerFactory>>) -> SocketAddr {
    supervisor
        .current()
        .unwrap()
        .socket("echo")
        .unwrap()
        .local_addr()
        .unwrap()
}

fn worker_pids(supervisor: &Supervisor<ForkProcess<EchoServerFactory>>) -> Vec<Pid> {
    supervisor.current().unwrap().group("echo").unwrap().pids()
}

fn is_gone(pid: Pid) -> bool {
    kill(pid, None) == Err(Errno::ESRCH)
}

#[test]
#[serial]
fn test_workers_echo() {
    let dir = TempDir::new().unwrap();
    let mut supervisor = supervisor(&dir, CONFIG);
    supervisor.start().unwrap();

    let addr = echo_addr(&supervisor);
    assert_eq!(echo(addr, b"hello"), b"hello");
    assert_eq!(echo(addr, b"again"), b"again");

    supervisor.shutdown();
}

#[test]
#[serial]
fn test_reload_keeps_port_and_replaces_workers() {
    let dir = TempDir::new().unwrap();
    let mut supervisor = supervisor(&dir, CONFIG);
    supervisor.start().unwrap();
    let addr = echo_addr(&supervisor);
    let old_pids = worker_pids(&supervisor);

    supervisor.handle().request_reload();
    supervisor.tick();

    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(supervisor.current_id().map(|id| id.get()), Some(2));
    assert_eq!(echo_addr(&supervisor), addr);
    assert!(old_pids.iter().all(|pid| is_gone(*pid)));
    assert_eq!(echo(addr, b"after reload"), b"after reload");

    supervisor.shutdown();
}

#[test]
#[serial]
fn test_rejected_reload_keeps_serving() {
    let dir = TempDir::new().unwrap();
    let mut supervisor = supervisor(&dir, CONFIG);
    supervisor.start().unwrap();
    let addr = echo_addr(&supervisor);
    let pids = worker_pids(&supervisor);

    fs::write(dir.path().join("prefork.toml"), CONFIG.replace("workers = 2", "workers = 0")).unwrap();
    supervisor.graceful_reload();

    assert_eq!(supervisor.current_id().map(|id| id.get()), Some(1));
    assert_eq!(worker_pids(&supervisor), pids);
    assert_eq!(echo(addr, b"still here"), b"still here");

    supervisor.shutdown();
}

#[test]
#[serial]
fn test_shutdown_reaps_every_worker() {
    let dir = TempDir::new().unwrap();
    let mut supervisor = supervisor(&dir, &CONFIG.replace("workers = 2", "workers = 3"));
    supervisor.start().unwrap();
    let pids = worker_pids(&supervisor);
    assert_eq!(pids.len(), 3);

    let report = supervisor.shutdown();
    assert_eq!(report.signalled, 3);
    assert_eq!(report.reaped, 3);
    assert!(report.is_clean());
    assert!(pids.iter().all(|pid| is_gone(*pid)));

    assert!(supervisor.shutdown().is_clean());
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}
