//! Diagnostic sinks for the arena allocators.
//!
//! Allocators never own a logger: they hold an optional [`LogSink`] handle and
//! report through the [`trace!`], [`debug!`], [`info!`], [`warn!`] and
//! [`error!`] macros. Every macro takes an `Option<&dyn LogSink>` as its first
//! argument; when it is `None` the message is dropped without being formatted.
//!
//! ```
//! use logger::{LogLevel, MemorySink, info};
//!
//! let sink = MemorySink::new(LogLevel::Debug);
//! info!(Some(&sink), "arena ready, {} bytes", 1024);
//! assert!(sink.contains(LogLevel::Info, "1024 bytes"));
//! ```

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use core::fmt;

pub use self::sink::{MemorySink, Record, WriterSink};

mod sink;

#[macro_export]
macro_rules! log {
    ($sink:expr, $level:expr, $($arg:tt)*) => {
        $crate::log($sink, $level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! trace {
    ($sink:expr, $($arg:tt)*) => {
        $crate::log!($sink, $crate::LogLevel::Trace, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($sink:expr, $($arg:tt)*) => {
        $crate::log!($sink, $crate::LogLevel::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($sink:expr, $($arg:tt)*) => {
        $crate::log!($sink, $crate::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($sink:expr, $($arg:tt)*) => {
        $crate::log!($sink, $crate::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($sink:expr, $($arg:tt)*) => {
        $crate::log!($sink, $crate::LogLevel::Error, $($arg)*)
    };
}

/// Forwards `message` to `sink` if one is present and accepts `level`.
pub fn log(sink: Option<&dyn LogSink>, level: LogLevel, message: fmt::Arguments<'_>) {
    if let Some(sink) = sink {
        if sink.enabled(level) {
            sink.log(level, message);
        }
    }
}

/// Destination of diagnostic messages.
///
/// Implementations must be cheap to call and must never fail: logging is
/// best effort and has no influence on allocator control flow.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: fmt::Arguments<'_>);

    fn enabled(&self, level: LogLevel) -> bool {
        let _ = level;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Right-aligned, ANSI coloured level tag.
pub struct LevelFormat(pub LogLevel);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            LogLevel::Trace => 35,
            LogLevel::Debug => 34,
            LogLevel::Info => 32,
            LogLevel::Warn => 33,
            LogLevel::Error => 31,
        };
        write!(f, "\x1B[{color};1m{:>5}\x1B[0m", self.0.as_str())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::{format, string::ToString as _};

    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn level_format_pads_and_colors() {
        assert_eq!(
            LevelFormat(LogLevel::Info).to_string(),
            "\x1B[32;1m INFO\x1B[0m"
        );
        assert_eq!(format!("{:>5}", LogLevel::Warn), " WARN");
    }

    #[test]
    fn absent_sink_is_ignored() {
        error!(None, "nobody listens to {}", "this");
    }

    #[test]
    fn disabled_levels_are_filtered() {
        let sink = MemorySink::new(LogLevel::Warn);
        debug!(Some(&sink), "too chatty");
        warn!(Some(&sink), "worth keeping");
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Warn);
        assert_eq!(records[0].message, "worth keeping");
    }
}
