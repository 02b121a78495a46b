#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON-lines diagnostics shared across the dosegrid crates.

use std::{
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(anyhow!("unknown log level `{other}`")),
        }
    }
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the log.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Dotted event name, e.g. `run.end`.
    pub message: String,
    /// Structured fields attached to the event.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Attaches the fields of a JSON object as metadata; other values are ignored.
    #[must_use]
    pub fn with_metadata(mut self, metadata: &serde_json::Value) -> Self {
        if let Some(obj) = metadata.as_object() {
            self.metadata = obj.clone();
        }
        self
    }
}

/// Where a [`DiagnosticLogger`] writes its lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Append-only file, created with its parent directories.
    File(PathBuf),
    /// Process standard error.
    Stderr,
}

/// Thread-safe JSON-lines logger with a minimum severity filter.
pub struct DiagnosticLogger {
    target: LogTarget,
    min_level: LogLevel,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl fmt::Debug for DiagnosticLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticLogger")
            .field("target", &self.target)
            .field("min_level", &self.min_level)
            .finish()
    }
}

impl DiagnosticLogger {
    /// Opens a logger appending to the file at `path`.
    pub fn file(path: impl AsRef<Path>, min_level: LogLevel) -> Result<Self> {
        Self::new(LogTarget::File(path.as_ref().to_path_buf()), min_level)
    }

    /// Creates a logger writing to stderr.
    #[must_use]
    pub fn stderr(min_level: LogLevel) -> Self {
        Self {
            target: LogTarget::Stderr,
            min_level,
            writer: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// Creates a logger for the given target.
    pub fn new(target: LogTarget, min_level: LogLevel) -> Result<Self> {
        match target {
            LogTarget::Stderr => Ok(Self::stderr(min_level)),
            LogTarget::File(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file: File = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)?;
                Ok(Self {
                    target: LogTarget::File(path),
                    min_level,
                    writer: Mutex::new(Box::new(file)),
                })
            }
        }
    }

    /// Returns true when records at `level` would be written.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Writes a log record as a JSON line. Records below the minimum level are dropped.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if !self.enabled(record.level) {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the file path when logging to a file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            LogTarget::File(path) => Some(path),
            LogTarget::Stderr => None,
        }
    }

    /// Minimum level written by this logger.
    #[must_use]
    pub const fn min_level(&self) -> LogLevel {
        self.min_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = DiagnosticLogger::file(dir.path().join("diag.log"), LogLevel::Debug).unwrap();
        logger
            .log(&LogRecord::new("controller", LogLevel::Info, "run.end"))
            .unwrap();
        let content = fs::read_to_string(logger.path().unwrap()).unwrap();
        assert!(content.contains("\"message\":\"run.end\""));
        assert!(content.contains("\"level\":\"INFO\""));
    }

    #[test]
    fn drops_records_below_min_level() {
        let dir = tempdir().unwrap();
        let logger = DiagnosticLogger::file(dir.path().join("diag.log"), LogLevel::Warn).unwrap();
        logger
            .log(&LogRecord::new("controller", LogLevel::Debug, "noise"))
            .unwrap();
        logger
            .log(
                &LogRecord::new("controller", LogLevel::Error, "report.write_failed")
                    .with_metadata(&json!({ "run": 3 })),
            )
            .unwrap();
        let content = fs::read_to_string(logger.path().unwrap()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("\"run\":3"));
    }

    #[test]
    fn parses_levels() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" INFO ".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error > LogLevel::Debug);
    }
}
