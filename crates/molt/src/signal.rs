//! The signal controller.
//!
//! A single long-lived loop translating OS signals into lifecycle
//! operations:
//!
//! | Signal | Action |
//! |---|---|
//! | `SIGINT`, `SIGTERM` | graceful shutdown with the lame-duck window |
//! | `SIGHUP` | graceful restart (descriptor handoff to a successor) |
//! | `SIGUSR1` | log a stack dump and keep serving |
//! | anything else handled | warn and keep serving |
//!
//! Once a shutdown or restart is in flight there is no way back to idle: a
//! second signal of any kind aborts the process immediately.

use std::sync::Arc;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn};

use crate::fatal;
use crate::flag::FlagSet;
use crate::log;

enum Action {
    Shutdown(&'static str),
    Restart,
    StackDump,
    Unknown(&'static str),
}

struct Signals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
    usr1: Signal,
    usr2: Signal,
    quit: Signal,
}

impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            usr1: signal(SignalKind::user_defined1())?,
            usr2: signal(SignalKind::user_defined2())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn next(&mut self) -> Action {
        tokio::select! {
            _ = self.interrupt.recv() => Action::Shutdown("SIGINT"),
            _ = self.terminate.recv() => Action::Shutdown("SIGTERM"),
            _ = self.hangup.recv() => Action::Restart,
            _ = self.usr1.recv() => Action::StackDump,
            _ = self.usr2.recv() => Action::Unknown("SIGUSR2"),
            _ = self.quit.recv() => Action::Unknown("SIGQUIT"),
        }
    }
}

impl FlagSet {
    /// Run the signal controller. The last thing to call from `main`: it
    /// blocks until a terminating signal drives the process through
    /// shutdown or restart, both of which exit the process.
    pub async fn run(self: Arc<Self>) {
        let mut signals = match Signals::install() {
            Ok(signals) => signals,
            Err(e) => fatal!("Failed to install signal handlers: {e}"),
        };
        debug!("Signal controller running");
        loop {
            match signals.next().await {
                Action::Shutdown(name) => {
                    info!(signal = name, "Shutting down");
                    let flags = Arc::clone(&self);
                    tokio::spawn(async move { flags.shutdown(flags.lame_duck()).await });
                    signals.next().await;
                    fatal!("Shutdown aborted");
                }
                Action::Restart => {
                    info!(signal = "SIGHUP", "Restarting");
                    let flags = Arc::clone(&self);
                    tokio::spawn(async move { flags.restart(flags.lame_duck()).await });
                    signals.next().await;
                    fatal!("Restart aborted");
                }
                Action::StackDump => {
                    info!("Stack dump:\n{}", log::stack());
                }
                Action::Unknown(name) => {
                    warn!(signal = name, "Unknown signal");
                }
            }
        }
    }
}
