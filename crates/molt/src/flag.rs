//! Command-line flags and the flag registry.
//!
//! [`FlagSet`] is the explicit home of everything the substrate needs to
//! know about the process's flags: it builds the `clap` command, applies
//! parsed values, and can re-emit every registered flag as `--name=value`
//! to reconstruct the successor's argument vector in registration order.
//!
//! A listener flag resolves to one of two modes:
//!
//! - *bind* — `host:port`, resolved in the flag's network family at parse
//!   time; activation binds a fresh socket;
//! - *adopt* — `&N`, a descriptor number inherited from the parent;
//!   activation takes over the already-listening socket behind it.
//!
//! The ampersand form is what a restarting process writes into its
//! successor's argv, so a daemon embedding this crate restarts with no
//! listening gap: the socket never closes, only the process behind it
//! changes.

use std::ffi::OsString;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::error::DaemonError;
use crate::lifecycle::DEFAULT_LAME_DUCK;
use crate::listener::TrackedListener;
use crate::log;

/// Network family for a listener flag, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Either address family.
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl Family {
    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Tcp => true,
            Family::Tcp4 => addr.is_ipv4(),
            Family::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Family::Tcp => "tcp",
            Family::Tcp4 => "tcp4",
            Family::Tcp6 => "tcp6",
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Bind(SocketAddr),
    Adopt(RawFd),
}

/// A registered listener flag. Cheap to clone; all clones share state with
/// the registry's copy.
#[derive(Clone)]
pub struct ListenerFlag {
    state: Arc<ListenerState>,
}

struct ListenerState {
    name: String,
    proto: String,
    family: Family,
    default: String,
    mode: Mutex<Option<Mode>>,
    listener: OnceLock<Arc<TrackedListener>>,
}

impl ListenerFlag {
    fn set(&self, value: &str) -> Result<(), DaemonError> {
        if value.is_empty() {
            return Err(DaemonError::Empty {
                flag: self.state.name.clone(),
            });
        }
        let mode = if let Some(fd) = value.strip_prefix('&') {
            let fd: RawFd = fd.parse().map_err(|_| DaemonError::Invalid {
                flag: self.state.name.clone(),
                value: value.to_string(),
            })?;
            if fd < 0 {
                return Err(DaemonError::Invalid {
                    flag: self.state.name.clone(),
                    value: value.to_string(),
                });
            }
            Mode::Adopt(fd)
        } else {
            Mode::Bind(resolve(value, self.state.family)?)
        };
        *self.state.mode.lock().expect("flag state poisoned") = Some(mode);
        Ok(())
    }

    fn mode(&self) -> Option<Mode> {
        *self.state.mode.lock().expect("flag state poisoned")
    }

    /// Activate the flag: bind a fresh socket or adopt the inherited
    /// descriptor, and wrap it in a [`TrackedListener`] the registry can
    /// later enumerate.
    ///
    /// # Panics
    ///
    /// Panics if called before the flag set was parsed, or a second time.
    pub async fn listen(&self) -> Result<Arc<TrackedListener>, DaemonError> {
        let mode = self
            .mode()
            .unwrap_or_else(|| panic!("--{} activated before parse", self.state.name));
        let (listener, source) = match mode {
            Mode::Bind(addr) => (
                TcpListener::bind(addr).await.map_err(DaemonError::Io)?,
                "bind",
            ),
            Mode::Adopt(fd) => (adopt(fd)?, "inherited"),
        };
        let tracked = Arc::new(TrackedListener::new(listener)?);
        info!(
            proto = %self.state.proto,
            addr = %tracked.addr(),
            source,
            "Listening"
        );
        assert!(
            self.state.listener.set(Arc::clone(&tracked)).is_ok(),
            "--{} activated twice",
            self.state.name
        );
        Ok(tracked)
    }

    /// The tracked listener this flag produced, if it has been activated.
    pub fn listener(&self) -> Option<Arc<TrackedListener>> {
        self.state.listener.get().cloned()
    }

    fn value(&self) -> String {
        match self.mode() {
            Some(Mode::Bind(addr)) => addr.to_string(),
            Some(Mode::Adopt(fd)) => format!("&{fd}"),
            None => self.state.default.clone(),
        }
    }
}

/// A plain string flag registered by the embedding program, enumerable and
/// re-emitted to the successor like every other flag.
#[derive(Clone)]
pub struct TextFlag {
    state: Arc<TextState>,
}

struct TextState {
    name: String,
    help: String,
    default: String,
    value: Mutex<String>,
}

impl TextFlag {
    /// The current value of the flag.
    pub fn value(&self) -> String {
        self.state.value.lock().expect("flag state poisoned").clone()
    }

    fn set(&self, value: &str) {
        *self.state.value.lock().expect("flag state poisoned") = value.to_string();
    }
}

enum Flag {
    Listener(ListenerFlag),
    LogLevel {
        name: String,
    },
    LogFile {
        name: String,
        mode: u32,
        path: Mutex<Option<String>>,
    },
    Text(TextFlag),
}

impl Flag {
    fn name(&self) -> &str {
        match self {
            Flag::Listener(f) => &f.state.name,
            Flag::LogLevel { name } => name,
            Flag::LogFile { name, .. } => name,
            Flag::Text(f) => &f.state.name,
        }
    }

    fn help(&self) -> String {
        match self {
            Flag::Listener(f) => format!("Address on which to listen for {}", f.state.proto),
            Flag::LogLevel { .. } => {
                "Log level (0=Error, 1=Warning, 2=Info, 3+=Verbose)".to_string()
            }
            Flag::LogFile { .. } => "Log file (also writes to stderr if set)".to_string(),
            Flag::Text(f) => f.state.help.clone(),
        }
    }

    fn default_value(&self) -> Option<String> {
        match self {
            Flag::Listener(f) => Some(f.state.default.clone()),
            Flag::LogLevel { .. } => Some(log::DEFAULT_THRESHOLD.to_string()),
            Flag::LogFile { .. } => None,
            Flag::Text(f) => Some(f.state.default.clone()),
        }
    }

    fn current_value(&self) -> String {
        match self {
            Flag::Listener(f) => f.value(),
            Flag::LogLevel { .. } => log::threshold().to_string(),
            Flag::LogFile { path, .. } => path
                .lock()
                .expect("flag state poisoned")
                .clone()
                .unwrap_or_default(),
            Flag::Text(f) => f.value(),
        }
    }
}

/// The registry of a process's flags and the handle the lifecycle
/// operations and signal controller act on.
pub struct FlagSet {
    program: String,
    flags: Vec<Flag>,
    lame_duck: Duration,
}

impl FlagSet {
    /// Create an empty registry. Also installs the log sink.
    pub fn new(program: impl Into<String>) -> Self {
        log::init();
        Self {
            program: program.into(),
            flags: Vec::new(),
            lame_duck: DEFAULT_LAME_DUCK,
        }
    }

    /// Register a listener flag. The returned handle is activated with
    /// [`ListenerFlag::listen`] after [`parse`](Self::parse); `proto` names
    /// the protocol in the flag's help text.
    pub fn listener(
        &mut self,
        name: &str,
        family: Family,
        default_addr: &str,
        proto: &str,
    ) -> ListenerFlag {
        let flag = ListenerFlag {
            state: Arc::new(ListenerState {
                name: name.to_string(),
                proto: proto.to_string(),
                family,
                default: default_addr.to_string(),
                mode: Mutex::new(None),
                listener: OnceLock::new(),
            }),
        };
        self.flags.push(Flag::Listener(flag.clone()));
        flag
    }

    /// Register the log threshold flag (`--name=<int>`).
    pub fn log_level(&mut self, name: &str) {
        self.flags.push(Flag::LogLevel {
            name: name.to_string(),
        });
    }

    /// Register the log file flag (`--name=<path>`); `mode` gives the
    /// permission bits used if the file has to be created.
    pub fn log_file(&mut self, name: &str, mode: u32) {
        self.flags.push(Flag::LogFile {
            name: name.to_string(),
            mode,
            path: Mutex::new(None),
        });
    }

    /// Register an arbitrary string flag for the embedding program.
    pub fn text(&mut self, name: &str, default: &str, help: &str) -> TextFlag {
        let flag = TextFlag {
            state: Arc::new(TextState {
                name: name.to_string(),
                help: help.to_string(),
                default: default.to_string(),
                value: Mutex::new(default.to_string()),
            }),
        };
        self.flags.push(Flag::Text(flag.clone()));
        flag
    }

    /// The drain window granted to shutdown and restart.
    pub fn lame_duck(&self) -> Duration {
        self.lame_duck
    }

    /// Override the drain window (default 15 s).
    pub fn set_lame_duck(&mut self, lame_duck: Duration) {
        self.lame_duck = lame_duck;
    }

    fn command(&self) -> clap::Command {
        let mut cmd = clap::Command::new(self.program.clone());
        for flag in &self.flags {
            cmd = cmd.arg(
                clap::Arg::new(flag.name().to_string())
                    .long(flag.name().to_string())
                    .num_args(1)
                    .help(flag.help()),
            );
        }
        cmd
    }

    fn apply_matches(&self, matches: &clap::ArgMatches) -> Result<(), DaemonError> {
        for flag in &self.flags {
            // Registered defaults apply when the flag was not given.
            let fallback;
            let value = match matches.get_one::<String>(flag.name()) {
                Some(value) => value.as_str(),
                None => match flag.default_value() {
                    Some(default) => {
                        fallback = default;
                        fallback.as_str()
                    }
                    None => continue,
                },
            };
            match flag {
                Flag::Listener(f) => f.set(value)?,
                Flag::LogLevel { name } => {
                    let level: i32 = value.trim().parse().map_err(|_| DaemonError::Invalid {
                        flag: name.clone(),
                        value: value.to_string(),
                    })?;
                    log::set_threshold(level);
                }
                Flag::LogFile { mode, path, .. } => {
                    // An empty value is how an unset predecessor flag
                    // re-emits; treat it as absent.
                    if !value.is_empty() {
                        log::set_file(Path::new(value), *mode)?;
                        *path.lock().expect("flag state poisoned") = Some(value.to_string());
                    }
                }
                Flag::Text(f) => f.set(value),
            }
        }
        Ok(())
    }

    /// Parse the process's arguments and apply every flag value. Usage
    /// errors and `--help` print and exit, as command-line tools do.
    pub fn parse(&self) -> Result<(), DaemonError> {
        let matches = self.command().get_matches_from(std::env::args());
        self.apply_matches(&matches)
    }

    /// Parse from an explicit argument vector, returning usage errors
    /// instead of exiting.
    pub fn try_parse_from<I, T>(&self, args: I) -> Result<(), DaemonError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = self.command().try_get_matches_from(args)?;
        self.apply_matches(&matches)
    }

    /// Every tracked listener produced by an activated listener flag, in
    /// registration order.
    pub(crate) fn active_listeners(&self) -> Vec<Arc<TrackedListener>> {
        self.flags
            .iter()
            .filter_map(|flag| match flag {
                Flag::Listener(f) => f.listener(),
                _ => None,
            })
            .collect()
    }

    /// Reconstruct the successor's argument vector: the current executable,
    /// plus every registered flag as `--name=value` in registration order.
    /// Activated listener flags re-emit as `--name=&N` with `N` a freshly
    /// duplicated descriptor that stays open in the child.
    pub(crate) fn successor_args(
        &self,
    ) -> Result<(std::path::PathBuf, Vec<String>, Vec<Arc<TrackedListener>>), DaemonError> {
        let exe = std::env::current_exe().map_err(DaemonError::Io)?;
        let mut args = Vec::with_capacity(self.flags.len());
        let mut ports = Vec::new();
        for flag in &self.flags {
            if let Flag::Listener(f) = flag {
                if let Some(listener) = f.listener() {
                    let fd = listener.dup()?;
                    args.push(format!("--{}=&{}", f.state.name, fd));
                    ports.push(listener);
                    continue;
                }
            }
            args.push(format!("--{}={}", flag.name(), flag.current_value()));
        }
        Ok((exe, args, ports))
    }
}

fn resolve(value: &str, family: Family) -> Result<SocketAddr, DaemonError> {
    // A bare `:port` resolves against the family's unspecified address.
    let target = if value.starts_with(':') {
        match family {
            Family::Tcp6 => format!("[::]{value}"),
            _ => format!("0.0.0.0{value}"),
        }
    } else {
        value.to_string()
    };
    let resolved = target.to_socket_addrs().map_err(|e| DaemonError::Resolve {
        addr: value.to_string(),
        family,
        source: e,
    })?;
    resolved
        .into_iter()
        .find(|addr| family.matches(addr))
        .ok_or_else(|| DaemonError::Resolve {
            addr: value.to_string(),
            family,
            source: io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address in the requested family",
            ),
        })
}

/// Take over an inherited descriptor that must refer to an already-bound,
/// already-listening socket prepared by the parent.
fn adopt(fd: RawFd) -> Result<TcpListener, DaemonError> {
    if !is_socket(fd) {
        return Err(DaemonError::Adopt {
            fd,
            source: io::Error::new(io::ErrorKind::InvalidInput, "not an open socket"),
        });
    }
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener
        .set_nonblocking(true)
        .map_err(|source| DaemonError::Adopt { fd, source })?;
    TcpListener::from_std(std_listener).map_err(|source| DaemonError::Adopt { fd, source })
}

fn is_socket(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
