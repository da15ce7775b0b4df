//! Helpers for driving a `molt-echod` process in scenario tests.
#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// A spawned echo daemon with its stderr (the log stream) tapped line by
/// line. The successor of a restart shares the same stderr pipe, so its
/// records show up here too.
pub struct EchoDaemon {
    child: Child,
    lines: Receiver<String>,
    seen: Vec<String>,
}

pub fn spawn_echod(args: &[&str]) -> EchoDaemon {
    let mut child = Command::new(env!("CARGO_BIN_EXE_molt-echod"))
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn molt-echod");
    let stderr = child.stderr.take().expect("stderr is piped");
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    EchoDaemon {
        child,
        lines: rx,
        seen: Vec::new(),
    }
}

impl EchoDaemon {
    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Consume log lines until one contains `needle`, or panic with
    /// everything seen so far.
    pub fn expect_line(&mut self, needle: &str, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(line) => {
                    self.seen.push(line.clone());
                    if line.contains(needle) {
                        return line;
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    panic!(
                        "no log line containing {needle:?} within {timeout:?}; seen:\n{}",
                        self.seen.join("\n")
                    );
                }
            }
        }
    }

    /// True once a line containing `needle` has been observed, checking
    /// lines already consumed and waiting up to `timeout` for new ones.
    pub fn eventually_saw(&mut self, needle: &str, timeout: Duration) -> bool {
        if self.seen.iter().any(|line| line.contains(needle)) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(line) => {
                    self.seen.push(line.clone());
                    if line.contains(needle) {
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
    }

    pub fn signal(&self, sig: i32) {
        let rc = unsafe { libc::kill(self.pid(), sig) };
        assert_eq!(rc, 0, "kill({}, {sig}) failed", self.pid());
    }

    pub fn assert_running(&mut self) {
        assert!(
            self.child.try_wait().expect("try_wait").is_none(),
            "daemon exited early; seen:\n{}",
            self.seen.join("\n")
        );
    }

    pub fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().expect("try_wait") {
                return status;
            }
            if Instant::now() >= deadline {
                let _ = self.child.kill();
                panic!(
                    "daemon did not exit within {timeout:?}; seen:\n{}",
                    self.seen.join("\n")
                );
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}

impl Drop for EchoDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn an echo daemon at `--loglevel=3` with the given drain window and
/// wait until it is accepting *and* its signal controller is installed.
/// Returns the daemon and its bound address.
pub fn spawn_ready(lame_duck_ms: u64) -> (EchoDaemon, String) {
    let lame_duck = format!("--lame-duck-ms={lame_duck_ms}");
    let mut daemon = spawn_echod(&["--listen=127.0.0.1:0", "--loglevel=3", &lame_duck]);
    let ready = daemon.expect_line("Echo service ready", Duration::from_secs(10));
    let addr = addr_field(&ready);
    daemon.expect_line("Signal controller running", Duration::from_secs(10));
    (daemon, addr)
}

/// Pull the `addr=…` field out of a log record.
pub fn addr_field(line: &str) -> String {
    line.split("addr=")
        .nth(1)
        .unwrap_or_else(|| panic!("no addr field in {line:?}"))
        .split_whitespace()
        .next()
        .expect("addr value")
        .to_string()
}

/// Pull the `pid=…` field out of a log record.
pub fn pid_field(line: &str) -> i32 {
    line.split("pid=")
        .nth(1)
        .unwrap_or_else(|| panic!("no pid field in {line:?}"))
        .split_whitespace()
        .next()
        .expect("pid value")
        .parse()
        .expect("pid is numeric")
}

/// Connect to the daemon and prove the connection is served end to end.
pub fn echo_roundtrip(addr: &str) -> TcpStream {
    let mut conn = TcpStream::connect(addr).expect("connect to echo daemon");
    conn.set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    assert_echoes(&mut conn);
    conn
}

/// One write/read cycle on an existing connection.
pub fn assert_echoes(conn: &mut TcpStream) {
    conn.write_all(b"hello\n").expect("write to echo daemon");
    let mut buf = [0u8; 6];
    conn.read_exact(&mut buf).expect("read echo back");
    assert_eq!(&buf, b"hello\n");
}
