//! Restart scenarios: descriptor handoff to a successor process.

mod common;

use std::time::Duration;

use common::{addr_field, assert_echoes, echo_roundtrip, pid_field, spawn_echod, spawn_ready};

/// SIGHUP spawns a successor that adopts the listening socket. New
/// connections are served by the successor while the predecessor finishes
/// its in-flight connection and exits 0. At no point is a connection
/// refused on the port.
#[test]
fn restart_hands_off_listener() {
    let (mut daemon, addr) = spawn_ready(10_000);

    let mut old_conn = echo_roundtrip(&addr);

    daemon.signal(libc::SIGHUP);
    let spawning = daemon.expect_line("Spawning successor", Duration::from_secs(5));
    assert!(
        spawning.contains("--listen=&"),
        "successor argv lacks an adopt-mode listener flag: {spawning}"
    );

    let spawned = daemon.expect_line("Spawned successor", Duration::from_secs(5));
    let successor_pid = pid_field(&spawned);

    // The successor logs to the same stderr pipe. Wait until it has
    // adopted the socket and reports ready on the same address.
    let successor_ready = daemon.expect_line("Echo service ready", Duration::from_secs(10));
    assert_eq!(addr_field(&successor_ready), addr);
    assert_eq!(pid_field(&successor_ready), successor_pid);

    // New connections are served (by the successor) with no refusal window.
    let new_conn = echo_roundtrip(&addr);

    // The predecessor still services the connection it accepted before the
    // handoff.
    assert_echoes(&mut old_conn);

    // Once the old connection closes, the predecessor drains out.
    drop(old_conn);
    let status = daemon.wait_exit(Duration::from_secs(10));
    assert_eq!(status.code(), Some(0));
    assert!(daemon.eventually_saw("Restart complete", Duration::from_secs(2)));

    drop(new_conn);
    unsafe { libc::kill(successor_pid, libc::SIGKILL) };
}

/// A predecessor that cannot drain in time dies fatally; the successor
/// keeps the port.
#[test]
fn restart_timeout_is_fatal() {
    let (mut daemon, addr) = spawn_ready(300);

    let _held = echo_roundtrip(&addr);

    daemon.signal(libc::SIGHUP);
    let spawned = daemon.expect_line("Spawned successor", Duration::from_secs(5));
    let successor_pid = pid_field(&spawned);

    let status = daemon.wait_exit(Duration::from_secs(10));
    assert_eq!(status.code(), Some(1));
    assert!(daemon.eventually_saw("Restart timed out", Duration::from_secs(2)));

    unsafe { libc::kill(successor_pid, libc::SIGKILL) };
}

/// Adopting a descriptor that is not open is fatal at startup, naming the
/// descriptor.
#[test]
fn adopt_bad_descriptor_is_fatal() {
    let mut daemon = spawn_echod(&["--listen=&999", "--loglevel=3"]);
    let status = daemon.wait_exit(Duration::from_secs(10));
    assert_eq!(status.code(), Some(1));
    assert!(daemon.eventually_saw("999", Duration::from_secs(2)), "fatal log should name descriptor 999");
}
