//! Leveled logging with a mutex-serialized sink.
//!
//! One logger serves the client or the daemon accept loop; each daemon
//! instance gets its own, prefixed with the instance name. Loggers are passed
//! as explicit `Arc<Logger>` handles.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Mutex;

use chrono::Local;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    /// Unrecognized names fall back to `Info`.
    pub fn parse(s: &str) -> Level {
        match s.to_ascii_lowercase().as_str() {
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

enum Sink {
    Stdout,
    File(File),
}

pub struct Logger {
    sink: Mutex<Sink>,
    level: Level,
    prefix: String,
}

impl Logger {
    pub fn stdout(level: Level, prefix: &str) -> Logger {
        Logger {
            sink: Mutex::new(Sink::Stdout),
            level,
            prefix: prefix.to_string(),
        }
    }

    /// Builds a logger for a configured target: the string `stdout` (or an
    /// empty value) selects standard output, anything else is an append-mode
    /// file. A file that cannot be opened falls back to stdout with a
    /// diagnostic rather than silencing the instance.
    pub fn from_target(target: &str, level: Level, prefix: &str) -> Logger {
        if target.is_empty() || target == "stdout" {
            return Logger::stdout(level, prefix);
        }
        match OpenOptions::new().create(true).append(true).open(target) {
            Ok(f) => Logger {
                sink: Mutex::new(Sink::File(f)),
                level,
                prefix: prefix.to_string(),
            },
            Err(err) => {
                eprintln!("failed to open log file {target}: {err}, using stdout");
                Logger::stdout(level, prefix)
            }
        }
    }

    fn write(&self, level: Level, msg: &str) {
        if level < self.level {
            return;
        }
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = if self.prefix.is_empty() {
            format!("[{ts}] [{}] {msg}", level.label())
        } else {
            format!("[{ts}] [{}] [{}] {msg}", level.label(), self.prefix)
        };
        if let Ok(mut sink) = self.sink.lock() {
            let _ = match &mut *sink {
                Sink::Stdout => writeln!(io::stdout(), "{line}"),
                Sink::File(f) => writeln!(f, "{line}"),
            };
        }
    }

    pub fn info(&self, msg: &str) {
        self.write(Level::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.write(Level::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.write(Level::Error, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(Level::parse("info"), Level::Info);
        assert_eq!(Level::parse("WARN"), Level::Warn);
        assert_eq!(Level::parse("warning"), Level::Warn);
        assert_eq!(Level::parse("error"), Level::Error);
        assert_eq!(Level::parse("nonsense"), Level::Info);
    }

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inst.log");
        let log = Logger::from_target(path.to_str().unwrap(), Level::Info, "inst");
        log.info("first");
        log.warn("second");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[INFO] [inst] first"));
        assert!(text.contains("[WARN] [inst] second"));
    }

    #[test]
    fn level_filter_suppresses_lower_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quiet.log");
        let log = Logger::from_target(path.to_str().unwrap(), Level::Error, "");
        log.info("hidden");
        log.error("shown");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("hidden"));
        assert!(text.contains("shown"));
    }
}
