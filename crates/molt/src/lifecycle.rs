//! Shutdown and restart.
//!
//! Both operations end the current process: they stop the listeners, wait
//! for in-flight connections to drain inside a bounded window, and exit 0.
//! A drain that outlives the window is fatal (exit 1 with a stack dump), as
//! is any failure to duplicate a descriptor or spawn the successor.
//!
//! The difference is what happens to the sockets. `shutdown` closes them —
//! the kernel refuses new connections while existing ones finish. `restart`
//! keeps them open: each listening descriptor is duplicated, the duplicate
//! number is written into the successor's argument vector as `--name=&N`,
//! and the successor adopts the socket before the predecessor exits, so
//! there is no moment at which a connection attempt can be refused.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::DaemonError;
use crate::fatal;
use crate::flag::FlagSet;
use crate::listener::TrackedListener;

/// Default drain window granted to shutdown and restart.
pub const DEFAULT_LAME_DUCK: Duration = Duration::from_secs(15);

impl FlagSet {
    /// Close every activated listener and wait for their connections to
    /// drain, then exit 0. Never returns control to the caller; exceeding
    /// `timeout` is fatal.
    pub async fn shutdown(&self, timeout: Duration) {
        let ports = self.active_listeners();
        for port in &ports {
            port.close().await;
        }
        if drain(&ports, timeout).await.is_err() {
            fatal!("Shutdown timed out after {timeout:?}");
        }
        info!("Shutdown complete");
        std::process::exit(0)
    }

    /// Re-exec the current binary with every registered flag re-emitted,
    /// listener flags rewritten to `&fd` so the successor adopts the live
    /// sockets, then drain and exit 0. Never returns control to the caller;
    /// descriptor duplication failure, spawn failure, and drain timeout are
    /// all fatal.
    pub async fn restart(&self, timeout: Duration) {
        let (exe, args, ports) = match self.successor_args() {
            Ok(successor) => successor,
            Err(e) => fatal!("Failed to prepare successor: {e}"),
        };
        for port in &ports {
            port.stop();
        }
        // Nudge accept loops blocked in the kernel so they observe the stop.
        for port in &ports {
            port.wake().await;
        }
        if let Err(e) = spawn(&exe, &args) {
            fatal!("{e}");
        }
        if drain(&ports, timeout).await.is_err() {
            fatal!("Restart timed out after {timeout:?}");
        }
        debug!("Restart complete");
        std::process::exit(0)
    }
}

/// Wait for every listener to drain, all under one deadline.
async fn drain(
    ports: &[Arc<TrackedListener>],
    timeout: Duration,
) -> Result<(), DaemonError> {
    let all = async {
        for port in ports {
            port.wait().await;
        }
    };
    tokio::time::timeout(timeout, all)
        .await
        .map_err(|_| DaemonError::Timeout(timeout))
}

/// Start the successor and abandon it: stdout and stderr are inherited, and
/// the duplicated listening descriptors ride along because they are not
/// close-on-exec.
fn spawn(exe: &Path, args: &[String]) -> Result<(), DaemonError> {
    info!(exe = %exe.display(), ?args, "Spawning successor");
    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|source| DaemonError::Spawn {
            exe: exe.to_path_buf(),
            source,
        })?;
    info!(pid = child.id(), "Spawned successor");
    Ok(())
}
