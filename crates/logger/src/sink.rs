use alloc::{
    string::{String, ToString as _},
    vec::Vec,
};
use core::fmt;

use spin::Mutex;

use crate::{LevelFormat, LogLevel, LogSink};

/// A message captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub level: LogLevel,
    pub message: String,
}

/// Sink that keeps every accepted message in memory.
#[derive(Debug)]
pub struct MemorySink {
    min_level: LogLevel,
    records: Mutex<Vec<Record>>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(LogLevel::Trace)
    }
}

impl MemorySink {
    #[must_use]
    pub const fn new(min_level: LogLevel) -> Self {
        Self {
            min_level,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Returns a snapshot of the captured records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    /// Returns `true` if a record at `level` contains `needle`.
    #[must_use]
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|record| record.level == level && record.message.contains(needle))
    }

    #[must_use]
    pub fn count(&self, level: LogLevel) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|record| record.level == level)
            .count()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, message: fmt::Arguments<'_>) {
        let message = message.to_string();
        self.records.lock().push(Record { level, message });
    }

    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }
}

/// Sink writing one line per message into any [`fmt::Write`] target.
///
/// Lines look like `DEBUG message`; with colour enabled the level tag is
/// wrapped in ANSI escape sequences. Write errors are ignored.
pub struct WriterSink<W> {
    min_level: LogLevel,
    colored: bool,
    writer: Mutex<W>,
}

impl<W> fmt::Debug for WriterSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSink")
            .field("min_level", &self.min_level)
            .field("colored", &self.colored)
            .finish_non_exhaustive()
    }
}

impl<W> WriterSink<W>
where
    W: fmt::Write,
{
    pub const fn new(writer: W, min_level: LogLevel) -> Self {
        Self {
            min_level,
            colored: false,
            writer: Mutex::new(writer),
        }
    }

    #[must_use]
    pub fn colored(mut self, colored: bool) -> Self {
        self.colored = colored;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W> LogSink for WriterSink<W>
where
    W: fmt::Write + Send,
{
    fn log(&self, level: LogLevel, message: fmt::Arguments<'_>) {
        let mut writer = self.writer.lock();
        let _ = if self.colored {
            writeln!(writer, "{} {message}", LevelFormat(level))
        } else {
            writeln!(writer, "{level:>5} {message}")
        };
    }

    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }
}
