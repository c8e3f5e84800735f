//! Library logger with pluggable sinks and per-level counters

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Destination for formatted log records
pub trait LogSink: Send {
    fn write(&mut self, record: &Record) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()>;

    fn accepts(&self, level: Level) -> bool;
}

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn format_record(record: &Record) -> String {
    format!(
        "[{}][{}] {} - {}\n",
        timestamp_ms(),
        record.level(),
        record.target(),
        record.args()
    )
}

/// Writes to stderr
pub struct StderrSink {
    level: Level,
}

impl StderrSink {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl LogSink for StderrSink {
    fn write(&mut self, record: &Record) -> std::io::Result<()> {
        std::io::stderr().write_all(format_record(record).as_bytes())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }

    fn accepts(&self, level: Level) -> bool {
        level <= self.level
    }
}

/// Appends to a file
pub struct FileSink {
    writer: BufWriter<File>,
    level: Level,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(path: P, level: Level) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            level,
        })
    }
}

impl LogSink for FileSink {
    fn write(&mut self, record: &Record) -> std::io::Result<()> {
        self.writer.write_all(format_record(record).as_bytes())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    fn accepts(&self, level: Level) -> bool {
        level <= self.level
    }
}

#[derive(Debug, Default)]
struct LoggerStats {
    total: AtomicUsize,
    error: AtomicUsize,
    warn: AtomicUsize,
    info: AtomicUsize,
    debug: AtomicUsize,
    trace: AtomicUsize,
    dropped: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerStatsView {
    pub total: usize,
    pub error: usize,
    pub warn: usize,
    pub info: usize,
    pub debug: usize,
    pub trace: usize,
    /// Records a sink failed to write
    pub dropped: usize,
}

/// Fabric logger
pub struct FabricLogger {
    sinks: Mutex<Vec<Box<dyn LogSink>>>,
    level: AtomicUsize,
    stats: LoggerStats,
}

impl FabricLogger {
    pub fn new(level: Level) -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            level: AtomicUsize::new(level as usize),
            stats: LoggerStats::default(),
        }
    }

    pub fn add_sink(&self, sink: Box<dyn LogSink>) {
        self.sinks.lock().push(sink);
    }

    pub fn add_file_sink<P: AsRef<Path>>(&self, path: P, level: Level) -> std::io::Result<()> {
        self.add_sink(Box::new(FileSink::new(path, level)?));
        Ok(())
    }

    pub fn set_level(&self, level: Level) {
        self.level.store(level as usize, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LoggerStatsView {
        LoggerStatsView {
            total: self.stats.total.load(Ordering::Relaxed),
            error: self.stats.error.load(Ordering::Relaxed),
            warn: self.stats.warn.load(Ordering::Relaxed),
            info: self.stats.info.load(Ordering::Relaxed),
            debug: self.stats.debug.load(Ordering::Relaxed),
            trace: self.stats.trace.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Log for FabricLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() as usize <= self.level.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let counter = match record.level() {
            Level::Error => &self.stats.error,
            Level::Warn => &self.stats.warn,
            Level::Info => &self.stats.info,
            Level::Debug => &self.stats.debug,
            Level::Trace => &self.stats.trace,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut sinks = self.sinks.lock();
        for sink in sinks.iter_mut() {
            if sink.accepts(record.level()) && sink.write(record).is_err() {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn flush(&self) {
        for sink in self.sinks.lock().iter_mut() {
            let _ = sink.flush();
        }
    }
}

/// Install a [`FabricLogger`] writing to stderr at `level`
pub fn init_logger(level: Level) -> Result<(), SetLoggerError> {
    let logger = FabricLogger::new(level);
    logger.add_sink(Box::new(StderrSink::new(level)));
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Trace);
    Ok(())
}
