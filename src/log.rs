use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::Utc;

/// Verbosity levels for runner output, ordered least to most chatty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

static RUNNER_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_log_level(level: LogLevel) {
    RUNNER_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn current_log_level() -> LogLevel {
    match RUNNER_LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

/// Parse a log level string. Returns `Err` with a message for invalid input.
pub fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    match s.to_lowercase().as_str() {
        "error" => Ok(LogLevel::Error),
        "warn" => Ok(LogLevel::Warn),
        "info" => Ok(LogLevel::Info),
        "debug" => Ok(LogLevel::Debug),
        _ => Err(format!(
            "Invalid log level '{}': expected error, warn, info, or debug",
            s
        )),
    }
}

/// Writes a level-tagged, UTC-timestamped line to stderr. Every `log_*!`
/// macro funnels through here so a long unattended run stays correlatable
/// against the timestamps in `events.jsonl` after the fact.
#[doc(hidden)]
pub fn emit(level: LogLevel, args: fmt::Arguments) {
    eprintln!("{} {:<5} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"), level.tag(), args);
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if $crate::log::current_log_level() >= $crate::log::LogLevel::Warn {
            $crate::log::emit($crate::log::LogLevel::Warn, format_args!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if $crate::log::current_log_level() >= $crate::log::LogLevel::Info {
            $crate::log::emit($crate::log::LogLevel::Info, format_args!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if $crate::log::current_log_level() >= $crate::log::LogLevel::Debug {
            $crate::log::emit($crate::log::LogLevel::Debug, format_args!($($arg)*))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("error").unwrap(), LogLevel::Error);
        assert_eq!(parse_log_level("warn").unwrap(), LogLevel::Warn);
        assert_eq!(parse_log_level("info").unwrap(), LogLevel::Info);
        assert_eq!(parse_log_level("debug").unwrap(), LogLevel::Debug);
        assert_eq!(parse_log_level("INFO").unwrap(), LogLevel::Info);
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_set_and_get_log_level() {
        // Note: tests share the global, so just verify round-trip
        set_log_level(LogLevel::Debug);
        assert_eq!(current_log_level(), LogLevel::Debug);
        set_log_level(LogLevel::Error);
        assert_eq!(current_log_level(), LogLevel::Error);
        // Restore default for other tests
        set_log_level(LogLevel::Info);
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
    }

    #[test]
    fn test_tag_is_stable_for_every_level() {
        assert_eq!(LogLevel::Error.tag(), "ERROR");
        assert_eq!(LogLevel::Warn.tag(), "WARN");
        assert_eq!(LogLevel::Info.tag(), "INFO");
        assert_eq!(LogLevel::Debug.tag(), "DEBUG");
    }
}
