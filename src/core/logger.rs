// ping-status - Systemd-Style Logger
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Systemd-style logging on stderr, compatible with journald
//!
//! stdout belongs to the rendered status line, so every diagnostic goes to
//! stderr. The logger follows systemd priorities, colors its output when
//! stderr is a terminal and can emit journald key=value records instead.

use once_cell::sync::OnceCell;
use std::sync::atomic::{ AtomicU8, Ordering };
use std::time::{ SystemTime, UNIX_EPOCH };

/// Log levels following systemd priority conventions
/// https://www.freedesktop.org/software/systemd/man/sd-daemon.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Error conditions (3)
    Error = 3,
    /// Warning conditions (4)
    Warning = 4,
    /// Normal but significant condition (5)
    Notice = 5,
    /// Informational message (6)
    Info = 6,
    /// Debug-level message (7)
    Debug = 7,
}

impl LogLevel {
    /// Convert numeric priority to LogLevel, clamping into the supported range
    pub fn from_priority(priority: u8) -> Self {
        match priority {
            0..=3 => LogLevel::Error,
            4 => LogLevel::Warning,
            5 => LogLevel::Notice,
            6 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    pub fn priority(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Get color code for terminal output
    pub fn color_code(self) -> &'static str {
        match self {
            LogLevel::Error => "\x1b[31m", // Red
            LogLevel::Warning => "\x1b[33m", // Yellow
            LogLevel::Notice => "\x1b[36m", // Cyan
            LogLevel::Info => "\x1b[32m", // Green
            LogLevel::Debug => "\x1b[37m", // White/gray
        }
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum log level to output
    pub min_level: LogLevel,
    pub use_colors: bool,
    pub include_timestamp: bool,
    /// Whether to include the emitting module path
    pub include_target: bool,
    /// Whether to format for journald (structured format)
    pub journald_format: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Warning,
            use_colors: atty::is(atty::Stream::Stderr),
            include_timestamp: true,
            include_target: false,
            journald_format: false,
        }
    }
}

static LOGGER: OnceCell<Logger> = OnceCell::new();

#[derive(Debug)]
pub struct Logger {
    config: LoggerConfig,
    min_level: AtomicU8,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self {
            min_level: AtomicU8::new(config.min_level.priority()),
            config,
        }
    }

    /// Initialize the global logger
    pub fn init(config: LoggerConfig) -> Result<(), LoggerError> {
        LOGGER.set(Self::new(config)).map_err(|_| LoggerError::AlreadyInitialized)
    }

    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level.priority(), Ordering::Relaxed);
    }

    pub fn should_log(&self, level: LogLevel) -> bool {
        level.priority() <= self.min_level.load(Ordering::Relaxed)
    }

    pub fn log(&self, level: LogLevel, target: &str, message: &str) {
        if !self.should_log(level) {
            return;
        }

        let timestamp = if self.config.include_timestamp {
            Some(SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs())
        } else {
            None
        };

        let formatted = if self.config.journald_format {
            self.format_journald(level, target, message, timestamp)
        } else {
            self.format_terminal(level, target, message, timestamp)
        };

        eprintln!("{}", formatted);
    }

    /// Format for journald structured output
    fn format_journald(
        &self,
        level: LogLevel,
        target: &str,
        message: &str,
        timestamp: Option<u64>
    ) -> String {
        let mut output = String::new();

        output.push_str(&format!("PRIORITY={}\n", level.priority()));
        output.push_str(&format!("MESSAGE={}\n", message));

        if self.config.include_target && !target.is_empty() {
            output.push_str(&format!("CODE_FILE={}\n", target));
        }

        if let Some(ts) = timestamp {
            output.push_str(&format!("_SOURCE_REALTIME_TIMESTAMP={}\n", ts * 1_000_000)); // microseconds
        }

        output.push_str("SYSLOG_IDENTIFIER=ping-status\n");

        output
    }

    fn format_terminal(
        &self,
        level: LogLevel,
        target: &str,
        message: &str,
        timestamp: Option<u64>
    ) -> String {
        let mut output = String::new();

        if let Some(ts) = timestamp {
            let datetime = chrono::DateTime
                ::from_timestamp(ts as i64, 0)
                .unwrap_or_default()
                .format("%Y-%m-%d %H:%M:%S");
            output.push_str(&format!("{} ", datetime));
        }

        // Status-style messages ("[   OK   ] ...") carry their own marker
        let status_style = message.starts_with("[*]") || message.starts_with("[   OK   ]");

        match (status_style, self.config.use_colors) {
            (true, true) => {
                output.push_str(&format!("{}{}\x1b[0m", level.color_code(), message));
            }
            (true, false) => output.push_str(message),
            (false, true) => {
                output.push_str(&format!(
                    "{}[{}]\x1b[0m {}",
                    level.color_code(),
                    level.as_str(),
                    message
                ));
            }
            (false, false) => output.push_str(&format!("[{}] {}", level.as_str(), message)),
        }

        if self.config.include_target && !target.is_empty() {
            output.push_str(&format!(" ({})", target));
        }

        output
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Error, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Warning, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_notice {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Notice, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Info, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::core::logger::log_with_level($crate::core::logger::LogLevel::Debug, module_path!(), &format!($($arg)*))
    };
}

/// Internal function to log with level. A no-op until [`Logger::init`] ran.
pub fn log_with_level(level: LogLevel, target: &str, message: &str) {
    if let Some(logger) = LOGGER.get() {
        logger.log(level, target, message);
    }
}

/// Systemd-style task starting message
pub fn log_task_start(task_name: &str) {
    let message = format!("[*] {}...", task_name);
    log_with_level(LogLevel::Notice, module_path!(), &message);
}

/// Systemd-style task completion with details
pub fn log_task_complete(task_name: &str, details: &str) {
    let message = format!("[   OK   ] {} ({})", task_name, details);
    log_with_level(LogLevel::Info, module_path!(), &message);
}

/// Logger initialization errors
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Logger already initialized")]
    AlreadyInitialized,
}

/// Initialize logger from CLI arguments
pub fn init_from_args(verbose: bool, debug: bool, journald: bool) -> Result<(), LoggerError> {
    let min_level = if debug {
        LogLevel::Debug
    } else if verbose {
        LogLevel::Info
    } else {
        LogLevel::Warning
    };

    let config = LoggerConfig {
        min_level,
        use_colors: atty::is(atty::Stream::Stderr) && !journald,
        include_timestamp: !journald,
        include_target: debug,
        journald_format: journald,
    };

    Logger::init(config)
}

pub fn should_log(level: LogLevel) -> bool {
    LOGGER.get().is_some_and(|logger| logger.should_log(level))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(min_level: LogLevel) -> Logger {
        Logger::new(LoggerConfig {
            min_level,
            use_colors: false,
            include_timestamp: false,
            include_target: false,
            journald_format: false,
        })
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warning);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert_eq!(LogLevel::from_priority(0), LogLevel::Error);
        assert_eq!(LogLevel::from_priority(42), LogLevel::Debug);
    }

    #[test]
    fn test_logger_level_filtering() {
        let logger = plain(LogLevel::Warning);

        assert!(logger.should_log(LogLevel::Error));
        assert!(logger.should_log(LogLevel::Warning));
        assert!(!logger.should_log(LogLevel::Info));

        logger.set_min_level(LogLevel::Debug);
        assert!(logger.should_log(LogLevel::Debug));
    }

    #[test]
    fn test_terminal_format_without_colors() {
        let logger = plain(LogLevel::Debug);
        let line = logger.format_terminal(LogLevel::Warning, "x", "plugin failed", None);
        assert_eq!(line, "[WARNING] plugin failed");

        let status = logger.format_terminal(LogLevel::Info, "x", "[   OK   ] Loading", None);
        assert_eq!(status, "[   OK   ] Loading");
    }

    #[test]
    fn test_journald_format() {
        let logger = plain(LogLevel::Debug);
        let record = logger.format_journald(LogLevel::Error, "x", "boom", Some(2));
        assert!(record.starts_with("PRIORITY=3\nMESSAGE=boom\n"));
        assert!(record.contains("_SOURCE_REALTIME_TIMESTAMP=2000000"));
        assert!(record.ends_with("SYSLOG_IDENTIFIER=ping-status\n"));
    }
}
