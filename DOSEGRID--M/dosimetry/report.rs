use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::{BestUnit, UnitCategory};

/// Human-readable transcript file name.
pub const TRANSCRIPT_FILE: &str = "ConsoleOutputData.txt";
/// Tab-separated table consumed by the plotting step.
pub const TABLE_FILE: &str = "ResultsToPlot.txt";

const RULE: &str = "------------------------------------------------------------";

/// Failure writing one of the report destinations.
#[derive(Debug, Error)]
pub enum ReportError {
    /// File could not be created or opened.
    #[error("opening {path}: {source}")]
    Open {
        /// Destination path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// File opened but the write or flush failed.
    #[error("writing {path}: {source}")]
    Write {
        /// Destination path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// One run's result as persisted to both destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    /// Reporting counter value for this run.
    pub run_index: u64,
    /// Events that deposited energy.
    pub events: u64,
    /// Primary description, e.g. `gamma of 6 MeV`.
    pub run_condition: String,
    /// Mass of the absorber selected by the counter, kg.
    pub absorber_mass_kg: f64,
    /// Dose estimate, Gy.
    pub dose_gy: f64,
    /// Dose uncertainty, Gy.
    pub dose_uncertainty_gy: f64,
    /// Number of scoring volumes in the grid.
    pub volume_count: usize,
}

impl ReportRecord {
    /// Multi-line transcript block.
    #[must_use]
    pub fn transcript_block(&self) -> String {
        format!(
            "\n The run consists of {} {} \n Dose in scoring volume : {} +- {} The number of volumes is: {} \n{RULE}\n",
            self.events,
            self.run_condition,
            BestUnit::new(self.dose_gy, UnitCategory::Dose),
            BestUnit::new(self.dose_uncertainty_gy, UnitCategory::Dose),
            self.volume_count,
        )
    }

    /// Tab-separated row terminated by CRLF.
    #[must_use]
    pub fn table_row(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\r\n",
            self.run_index,
            BestUnit::new(self.absorber_mass_kg, UnitCategory::Mass),
            BestUnit::new(self.dose_gy, UnitCategory::Dose),
            BestUnit::new(self.dose_uncertainty_gy, UnitCategory::Dose),
        )
    }
}

/// Which destinations already hold a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendProgress {
    /// Transcript block written.
    pub transcript: bool,
    /// Table row written.
    pub table: bool,
}

impl AppendProgress {
    /// Both destinations written.
    #[must_use]
    pub const fn is_complete(self) -> bool {
        self.transcript && self.table
    }
}

/// The two append-only report files.
#[derive(Debug, Clone)]
pub struct ReportSink {
    transcript: PathBuf,
    table: PathBuf,
}

impl ReportSink {
    /// Sink writing the standard file names inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            transcript: dir.join(TRANSCRIPT_FILE),
            table: dir.join(TABLE_FILE),
        }
    }

    /// Transcript path.
    #[must_use]
    pub fn transcript_path(&self) -> &Path {
        &self.transcript
    }

    /// Table path.
    #[must_use]
    pub fn table_path(&self) -> &Path {
        &self.table
    }

    /// Discards previous contents. Called once at process start.
    pub fn truncate(&self) -> Result<(), ReportError> {
        for path in [&self.transcript, &self.table] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| ReportError::Open {
                    path: path.clone(),
                    source,
                })?;
            }
            File::create(path).map_err(|source| ReportError::Open {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Appends the record to both destinations.
    pub fn append(&self, record: &ReportRecord) -> Result<(), ReportError> {
        let mut progress = AppendProgress::default();
        self.append_remaining(record, &mut progress)
    }

    /// Appends to the destinations not yet marked in `progress`, updating it as each succeeds.
    ///
    /// Each file is opened, written, flushed and closed within the call.
    pub fn append_remaining(
        &self,
        record: &ReportRecord,
        progress: &mut AppendProgress,
    ) -> Result<(), ReportError> {
        if !progress.transcript {
            append_text(&self.transcript, &record.transcript_block())?;
            progress.transcript = true;
        }
        if !progress.table {
            append_text(&self.table, &record.table_row())?;
            progress.table = true;
        }
        Ok(())
    }
}

fn append_text(path: &Path, text: &str) -> Result<(), ReportError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ReportError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(text.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|source| ReportError::Write {
            path: path.to_path_buf(),
            source,
        })
}
