//! Error types for the restart substrate.

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::flag::Family;

/// Errors surfaced by listeners, flags, and lifecycle operations.
///
/// `Stopped` is the one variant accept-loop implementations are expected to
/// handle themselves (by exiting cleanly); the lifecycle operations turn the
/// unrecoverable variants (`Dup`, `Spawn`, `Timeout`) into fatal logs.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Accept was called on a listener whose stop signal has been raised.
    #[error("listener stopped")]
    Stopped,

    /// A flag that requires an argument was given an empty one.
    #[error("--{flag} requires an argument")]
    Empty { flag: String },

    /// A flag value that could not be parsed.
    #[error("invalid value {value:?} for --{flag}")]
    Invalid { flag: String, value: String },

    /// A bind address that could not be resolved in the flag's family.
    #[error("failed to resolve {addr:?} as a {family} address")]
    Resolve {
        addr: String,
        family: Family,
        #[source]
        source: io::Error,
    },

    /// An inherited descriptor that cannot be adopted as a listener.
    #[error("inherited descriptor {fd} cannot be adopted as a listener")]
    Adopt {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// The OS refused to duplicate a listening descriptor.
    #[error("failed to duplicate descriptor {fd}")]
    Dup {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// Spawning the successor process failed.
    #[error("failed to spawn successor {exe:?}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A lifecycle drain exceeded its deadline.
    #[error("drain timed out after {0:?}")]
    Timeout(Duration),

    /// A flag-grammar error reported by the command-line parser.
    #[error(transparent)]
    Usage(#[from] clap::Error),

    /// An underlying I/O error, passed through verbatim.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DaemonError {
    /// True if this is the stopped-sentinel returned by a stopped listener.
    pub fn is_stopped(&self) -> bool {
        matches!(self, DaemonError::Stopped)
    }
}
