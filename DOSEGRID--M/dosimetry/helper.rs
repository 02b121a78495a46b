use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use chrono::Utc;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde_json::Value;
use shared_logging::{DiagnosticLogger, LogLevel, LogRecord, LogTarget};

/// Telemetry builder for the dosimetry components.
pub struct DoseTelemetryBuilder {
    module: String,
    target: LogTarget,
    min_level: LogLevel,
}

impl DoseTelemetryBuilder {
    /// Creates a new builder scoped to a module label. Logs go to stderr until a path is set.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            target: LogTarget::Stderr,
            min_level: LogLevel::Info,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.target = LogTarget::File(path.into());
        self
    }

    /// Sets the minimum level written.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Builds telemetry.
    pub fn build(self) -> Result<DoseTelemetry> {
        let logger = DiagnosticLogger::new(self.target, self.min_level)?;
        Ok(DoseTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
            }),
        })
    }
}

/// Telemetry handle shared across dosimetry components.
#[derive(Clone)]
pub struct DoseTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for DoseTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoseTelemetry")
            .field("module", &self.inner.module)
            .field("logger", &self.inner.logger)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: DiagnosticLogger,
}

impl DoseTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> DoseTelemetryBuilder {
        DoseTelemetryBuilder::new(module)
    }

    /// Logs a structured event.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let record = LogRecord::new(&self.inner.module, level, message).with_metadata(&metadata);
        self.inner.logger.log(&record)
    }

    /// Shorthand for an info record.
    pub fn info(&self, message: &str, metadata: Value) -> Result<()> {
        self.log(LogLevel::Info, message, metadata)
    }

    /// Shorthand for a warning record.
    pub fn warn(&self, message: &str, metadata: Value) -> Result<()> {
        self.log(LogLevel::Warn, message, metadata)
    }
}

/// Generates a random seed.
#[must_use]
pub fn random_seed() -> u64 {
    rand::thread_rng().gen()
}

/// Seed derived from wall-clock seconds, the way batch scans reseed each iteration.
#[must_use]
pub fn wall_clock_seed() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

/// Returns a reproducible RNG.
#[must_use]
pub fn seeded_rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log() {
        let tmp = tempdir().unwrap();
        let log_path = tmp.path().join("dose.log");
        let telemetry = DoseTelemetry::builder("controller")
            .log_path(&log_path)
            .min_level(LogLevel::Debug)
            .build()
            .unwrap();
        telemetry.info("run.begin", json!({ "run": 0 })).unwrap();
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("run.begin"));
        assert!(content.contains("\"module\":\"controller\""));
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let mut a = seeded_rng(7);
        let mut b = seeded_rng(7);
        assert_eq!(a.next_u64(), b.next_u64());
    }
}
