//! `log` backend that fans `[LEVEL] message` lines out to the boot consoles.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

use heapless::Vec;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::cmdline::CommandLine;
use crate::sync::SpinLock;

pub const MAX_SINKS: usize = 4;

const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

/// Somewhere log text can go: a serial port, a text-mode screen.
pub trait Sink: Sync {
    fn write_str(&self, text: &str);
}

pub struct KernelLogger {
    sinks: SpinLock<Vec<&'static dyn Sink, MAX_SINKS>>,
    level: AtomicUsize,
}

static LOGGER: KernelLogger = KernelLogger::new();

impl KernelLogger {
    pub const fn new() -> Self {
        Self {
            sinks: SpinLock::new(Vec::new()),
            level: AtomicUsize::new(DEFAULT_LEVEL as usize),
        }
    }

    /// Adds an output. Returns `false` when every sink slot is taken.
    pub fn add_sink(&self, sink: &'static dyn Sink) -> bool {
        self.sinks.lock().push(sink).is_ok()
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }

    pub fn level(&self) -> LevelFilter {
        match self.level.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

impl Default for KernelLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Sinks write outside the lock so a slow port does not stall other cores.
        let sinks = self.sinks.lock().clone();
        for sink in sinks.iter() {
            let _ = format_line(&mut SinkWriter(*sink), record.level(), *record.args());
        }
    }

    fn flush(&self) {}
}

struct SinkWriter<'a>(&'a dyn Sink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        self.0.write_str(text);
        Ok(())
    }
}

/// Writes one log line, newline included.
pub fn format_line(out: &mut impl Write, level: Level, args: fmt::Arguments<'_>) -> fmt::Result {
    writeln!(out, "[{}] {}", level, args)
}

/// Installs the kernel logger with its first sink.
pub fn init(sink: &'static dyn Sink, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.add_sink(sink);
    LOGGER.set_level(level);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Adds another output to the installed logger.
pub fn add_sink(sink: &'static dyn Sink) -> bool {
    LOGGER.add_sink(sink)
}

/// Applies `loglevel=` from the command line.
pub fn apply_cmdline(cmdline: &CommandLine<'_>) -> LevelFilter {
    let level = level_from(cmdline);
    LOGGER.set_level(level);
    log::set_max_level(level);
    level
}

/// The level named by `loglevel=`, falling back to `info`.
pub fn level_from(cmdline: &CommandLine<'_>) -> LevelFilter {
    cmdline
        .get("loglevel")
        .and_then(|name| name.parse().ok())
        .unwrap_or(DEFAULT_LEVEL)
}
