//! A line-echo daemon demonstrating zero-downtime restart.
//!
//! Serves TCP echo on `--listen`, drains gracefully on `SIGINT`/`SIGTERM`,
//! and hands its listening socket to a fresh copy of itself on `SIGHUP`.
//! Also the target of the crate's process-level scenario tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use molt::{DaemonError, Family, FlagSet, TrackedListener, TrackedStream};

#[tokio::main]
async fn main() -> Result<()> {
    let mut flags = FlagSet::new("molt-echod");
    let listen = flags.listener("listen", Family::Tcp, "127.0.0.1:7777", "echo");
    flags.log_level("loglevel");
    flags.log_file("logfile", 0o644);
    let lame_duck = flags.text(
        "lame-duck-ms",
        "15000",
        "Drain window for shutdown and restart, in milliseconds",
    );
    flags.parse()?;

    let lame_duck_value = lame_duck.value();
    let lame_duck_ms: u64 = match lame_duck_value.parse() {
        Ok(ms) => ms,
        Err(_) => molt::exit!(
            "--lame-duck-ms must be a duration in milliseconds, got {lame_duck_value:?}"
        ),
    };
    flags.set_lame_duck(Duration::from_millis(lame_duck_ms));

    let listener = match listen.listen().await {
        Ok(listener) => listener,
        Err(e) => molt::fatal!("Failed to listen: {e}"),
    };
    info!(addr = %listener.addr(), pid = std::process::id(), "Echo service ready");

    tokio::spawn(serve(Arc::clone(&listener)));

    // Blocks until a terminating signal exits the process.
    Arc::new(flags).run().await;
    Ok(())
}

async fn serve(listener: Arc<TrackedListener>) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                tokio::spawn(echo(stream));
            }
            Err(DaemonError::Stopped) => {
                debug!("Accept loop stopped");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
            }
        }
    }
}

async fn echo(mut stream: TrackedStream) {
    let peer = stream.peer_addr();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    warn!(%peer, error = %e, "Echo write failed");
                    break;
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "Echo read failed");
                break;
            }
        }
    }
    debug!(%peer, "Connection closed");
}
