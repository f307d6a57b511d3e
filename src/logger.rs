//! Remote-capable log lines.
//!
//! Lines emitted through [`RemoteLogger`] go to the `log` facade and, when
//! the transport is up, to the `log/{project}/{device}` endpoint.  The
//! threshold comes from the `log_level` config cell so the server can turn
//! a device's verbosity up or down.
//!
//! Line format (at most [`MAX_LINE_LEN`] bytes):
//!
//! ```text
//!   E (1234) runtime: battery voltage too low: 3100 mV
//! ```

use core::fmt::{self, Write};

pub const MAX_LINE_LEN: usize = 160;

pub type LogLine = heapless::String<MAX_LINE_LEN>;

/// Severity, most severe first.  A line passes when
/// `level <= threshold`; `NotSet` lets everything through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum LogLevel {
    Error = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
    Verbose = 4,
    NotSet = 5,
}

impl LogLevel {
    /// Out-of-range config values fall back to `NotSet`.
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => Self::Error,
            1 => Self::Warning,
            2 => Self::Info,
            3 => Self::Debug,
            4 => Self::Verbose,
            _ => Self::NotSet,
        }
    }

    pub const fn as_char(self) -> char {
        match self {
            Self::Error => 'E',
            Self::Warning => 'W',
            Self::Info => 'I',
            Self::Debug => 'D',
            Self::Verbose => 'V',
            Self::NotSet => '_',
        }
    }

    pub const fn to_log(self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warning => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Verbose | Self::NotSet => log::Level::Trace,
        }
    }
}

/// Writer that drops whatever does not fit instead of failing.
struct Truncating<'a>(&'a mut LogLine);

impl Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Header plus message, cut at [`MAX_LINE_LEN`] bytes on a char boundary.
pub fn format_line(
    level: LogLevel,
    uptime_ms: u64,
    tag: &str,
    args: fmt::Arguments<'_>,
) -> LogLine {
    let mut line = LogLine::new();
    let mut w = Truncating(&mut line);
    let _ = write!(w, "{} ({}) {}: ", level.as_char(), uptime_ms, tag);
    let _ = w.write_fmt(args);
    line
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteLogger {
    threshold: LogLevel,
}

impl Default for RemoteLogger {
    fn default() -> Self {
        Self {
            threshold: LogLevel::NotSet,
        }
    }
}

impl RemoteLogger {
    pub fn threshold(&self) -> LogLevel {
        self.threshold
    }

    pub fn set_threshold(&mut self, level: LogLevel) {
        self.threshold = level;
    }

    pub fn passes(&self, level: LogLevel) -> bool {
        level <= self.threshold
    }

    /// Format and emit locally.  Returns the line if it passed the
    /// threshold, for the caller to forward.
    pub fn emit(
        &self,
        level: LogLevel,
        uptime_ms: u64,
        tag: &str,
        args: fmt::Arguments<'_>,
    ) -> Option<LogLine> {
        if !self.passes(level) {
            return None;
        }
        let line = format_line(level, uptime_ms, tag, args);
        log::log!(level.to_log(), "{}", line);
        Some(line)
    }
}
