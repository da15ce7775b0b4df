//! Leveled log sink.
//!
//! Built on `tracing`, with the record shape and termination semantics the
//! rest of the substrate depends on:
//!
//! - one line per record:
//!   `[<pid>] <YYYY/MM/DD HH:MM:SS.micros> <file>:<line>: <L>: <message>`
//!   where `<L>` is `E`/`W`/`I`/`V`;
//! - an integer threshold (0=Error, 1=Warning, 2=Info, 3+=Verbose),
//!   consulted per record so it can change at runtime;
//! - every record goes to stderr; after [`set_file`] it is also appended to
//!   the log file, and the process's stdout descriptor is redirected there;
//! - records at Warning or above sync the log file after the write;
//! - [`fatal!`](crate::fatal) and [`exit!`](crate::exit) terminate the
//!   process with exit code 1 after the record is written, `fatal!` with a
//!   stack dump appended.
//!
//! Sink write failures are swallowed: a daemon that cannot log must still
//! drain and exit.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};

use chrono::Local;
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Default threshold: Info.
pub const DEFAULT_THRESHOLD: i32 = 2;

static THRESHOLD: AtomicI32 = AtomicI32::new(DEFAULT_THRESHOLD);
static TEE: OnceLock<TeeMakeWriter> = OnceLock::new();

/// Install the sink as the global `tracing` subscriber. Idempotent; a no-op
/// if another global subscriber is already installed (as in tests).
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let tee = TeeMakeWriter::default();
        // The threshold is read per record, so --loglevel can change it
        // after the subscriber is installed.
        let threshold = tracing_subscriber::filter::filter_fn(|meta| {
            filter_for(THRESHOLD.load(Ordering::Relaxed)) >= *meta.level()
        });
        let records = tracing_subscriber::fmt::layer()
            .event_format(RecordFormat)
            .with_writer(tee.clone());
        if tracing_subscriber::registry()
            .with(threshold)
            .with(records)
            .try_init()
            .is_ok()
        {
            let _ = TEE.set(tee);
        }
    });
}

/// Set the process-wide log threshold.
pub fn set_threshold(level: i32) {
    THRESHOLD.store(level, Ordering::Relaxed);
}

/// The current numeric threshold, as last set. Feeds the successor's
/// `--loglevel` value.
pub fn threshold() -> i32 {
    THRESHOLD.load(Ordering::Relaxed)
}

fn filter_for(level: i32) -> LevelFilter {
    match level {
        i32::MIN..=0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Open `path` for append (creating it with `mode` if absent), tee every
/// subsequent record to it, and redirect the process's stdout descriptor to
/// the file so stray prints land in the log.
pub fn set_file(path: &Path, mode: u32) -> io::Result<()> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(mode)
        .open(path)?;
    if unsafe { libc::dup2(file.as_raw_fd(), libc::STDOUT_FILENO) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(tee) = TEE.get() {
        tee.set_file(file);
    }
    Ok(())
}

/// A textual dump of the current thread's stack.
pub fn stack() -> String {
    std::backtrace::Backtrace::force_capture().to_string()
}

/// Log at Error with a stack dump appended, then terminate with exit code 1.
/// The record is written (and the log file synced) before the exit.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        ::tracing::error!("{}\n{}", ::std::format_args!($($arg)*), $crate::log::stack());
        ::std::process::exit(1)
    }};
}

/// Log at Error, then terminate with exit code 1. No stack dump.
#[macro_export]
macro_rules! exit {
    ($($arg:tt)*) => {{
        ::tracing::error!($($arg)*);
        ::std::process::exit(1)
    }};
}

/// Writes each record to stderr and, once a file is installed, to the file
/// as well. One `write_all` per sink per record; the file lives behind a
/// mutex so concurrent records serialize at record granularity.
#[derive(Clone, Default)]
pub(crate) struct TeeMakeWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl TeeMakeWriter {
    fn set_file(&self, file: File) {
        if let Ok(mut slot) = self.file.lock() {
            *slot = Some(file);
        }
    }
}

pub(crate) struct TeeWriter {
    file: Arc<Mutex<Option<File>>>,
    sync: bool,
}

impl io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().lock().write_all(buf);
        if let Ok(mut slot) = self.file.lock() {
            if let Some(file) = slot.as_mut() {
                let _ = file.write_all(buf);
                if self.sync {
                    let _ = file.sync_data();
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> TeeWriter {
        TeeWriter {
            file: Arc::clone(&self.file),
            sync: false,
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> TeeWriter {
        TeeWriter {
            file: Arc::clone(&self.file),
            sync: *meta.level() <= Level::WARN,
        }
    }
}

/// The one-line record format.
pub(crate) struct RecordFormat;

impl<S, N> FormatEvent<S, N> for RecordFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        write!(
            writer,
            "[{}] {} ",
            std::process::id(),
            Local::now().format("%Y/%m/%d %H:%M:%S%.6f")
        )?;
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            let file = file.rsplit('/').next().unwrap_or(file);
            write!(writer, "{file}:{line}: ")?;
        }
        write!(writer, "{}: ", level_letter(meta.level()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn level_letter(level: &Level) -> char {
    if *level == Level::ERROR {
        'E'
    } else if *level == Level::WARN {
        'W'
    } else if *level == Level::INFO {
        'I'
    } else {
        'V'
    }
}
