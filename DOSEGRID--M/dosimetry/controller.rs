use std::{fmt, sync::Arc};

use anyhow::Result;
use serde_json::{json, Value};
use shared_logging::{DiagnosticLogger, LogLevel, LogRecord};
use thiserror::Error;

use crate::{
    accumulator::RunAccumulator,
    engine::{EngineControls, RunDescriptor, RunHooks},
    geometry::DetectorGeometry,
    helper::DoseTelemetry,
    report::{AppendProgress, ReportError, ReportRecord, ReportSink},
    units::dose_gray,
};

const GLOBAL_RUN_BANNER: &str = "--------------------End of Global Run-----------------------";

/// Lifecycle of the controller across one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Between runs.
    Idle,
    /// Events are being accumulated.
    RunInProgress,
    /// Statistics and report are being produced.
    Reporting,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::RunInProgress => write!(f, "run_in_progress"),
            Self::Reporting => write!(f, "reporting"),
        }
    }
}

/// Controller misuse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    /// A callback arrived in a state that does not accept it.
    #[error("cannot handle {callback} while {state}")]
    InvalidTransition {
        /// Callback name.
        callback: &'static str,
        /// State at the time.
        state: ControllerState,
    },
    /// The geometry has no scoring volumes to report against.
    #[error("geometry has no scoring volumes")]
    NoVolumes,
}

/// What happened at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// No scoring event; nothing reported.
    Skipped,
    /// Record written to both destinations.
    Reported(ReportRecord),
    /// Record computed but not fully written; kept for [`RunController::retry_pending_reports`].
    WriteFailed {
        /// The computed record.
        record: ReportRecord,
        /// Display form of the I/O failure.
        error: String,
    },
}

impl RunOutcome {
    /// The computed record, written or not.
    #[must_use]
    pub const fn record(&self) -> Option<&ReportRecord> {
        match self {
            Self::Skipped => None,
            Self::Reported(record) | Self::WriteFailed { record, .. } => Some(record),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingReport {
    record: ReportRecord,
    progress: AppendProgress,
}

/// Owns the master accumulator and turns each finished run into a report.
pub struct RunController {
    state: ControllerState,
    master: RunAccumulator,
    report_counter: u64,
    geometry: Arc<DetectorGeometry>,
    sink: ReportSink,
    run_condition: String,
    pending: Vec<PendingReport>,
    echo_stdout: bool,
    telemetry: Option<DoseTelemetry>,
}

impl fmt::Debug for RunController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunController")
            .field("state", &self.state)
            .field("master", &self.master)
            .field("report_counter", &self.report_counter)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl RunController {
    /// Creates a controller reporting against `geometry` into `sink`.
    pub fn new(
        geometry: Arc<DetectorGeometry>,
        sink: ReportSink,
        run_condition: impl Into<String>,
        telemetry: Option<DoseTelemetry>,
    ) -> Result<Self, ControllerError> {
        if geometry.volume_count() == 0 {
            return Err(ControllerError::NoVolumes);
        }
        Ok(Self {
            state: ControllerState::Idle,
            master: RunAccumulator::new(),
            report_counter: 0,
            geometry,
            sink,
            run_condition: run_condition.into(),
            pending: Vec::new(),
            echo_stdout: false,
            telemetry,
        })
    }

    /// Echoes each transcript block to stdout under the global-run banner.
    #[must_use]
    pub const fn with_stdout_echo(mut self, echo: bool) -> Self {
        self.echo_stdout = echo;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ControllerState {
        self.state
    }

    /// Master accumulator of the current or last run.
    #[must_use]
    pub const fn accumulator(&self) -> &RunAccumulator {
        &self.master
    }

    /// Runs reported so far; also the index the next report will carry.
    #[must_use]
    pub const fn report_counter(&self) -> u64 {
        self.report_counter
    }

    /// Records whose write has not completed.
    #[must_use]
    pub fn pending_reports(&self) -> Vec<&ReportRecord> {
        self.pending.iter().map(|pending| &pending.record).collect()
    }

    /// Primary description used in the transcript.
    #[must_use]
    pub fn run_condition(&self) -> &str {
        &self.run_condition
    }

    /// Replaces the primary description, e.g. after the beam energy changes.
    pub fn set_run_condition(&mut self, run_condition: impl Into<String>) {
        self.run_condition = run_condition.into();
    }

    /// Starts a run: resets the master tally and turns off random-status persistence.
    pub fn begin_run(
        &mut self,
        run: &RunDescriptor,
        controls: &mut EngineControls,
    ) -> Result<(), ControllerError> {
        self.expect_state(ControllerState::Idle, "run begin")?;
        controls.random_number_store = false;
        self.master.reset();
        self.state = ControllerState::RunInProgress;
        self.diagnose(
            LogLevel::Debug,
            "run.begin",
            json!({ "run_id": run.id, "sequence": run.sequence, "requested": run.requested_events }),
        );
        Ok(())
    }

    /// Adds a scoring event to the master tally. Non-positive deposits are ignored.
    pub fn record_event(&mut self, energy_deposit: f64) {
        if self.state == ControllerState::RunInProgress && energy_deposit > 0.0 {
            self.master.add_event(energy_deposit);
        }
    }

    /// Folds a worker's tally into the master.
    pub fn merge_worker(&mut self, worker: &RunAccumulator) {
        if self.state == ControllerState::RunInProgress {
            self.master.merge(worker);
        }
    }

    /// Finishes a run: computes dose statistics and appends the report.
    pub fn end_run(&mut self, run: &RunDescriptor) -> Result<RunOutcome, ControllerError> {
        self.expect_state(ControllerState::RunInProgress, "run end")?;
        self.state = ControllerState::Reporting;
        let outcome = self.report(run);
        self.state = ControllerState::Idle;
        Ok(outcome)
    }

    /// Drops a run that failed after it began. Nothing is reported and the counter is kept.
    pub fn abort_run(&mut self, run: &RunDescriptor) {
        self.diagnose(
            LogLevel::Warn,
            "run.aborted",
            json!({
                "run_id": run.id,
                "sequence": run.sequence,
                "state": self.state.to_string(),
                "discarded_events": self.master.events(),
            }),
        );
        self.master.reset();
        self.state = ControllerState::Idle;
    }

    fn report(&mut self, run: &RunDescriptor) -> RunOutcome {
        let Some(stats) = self.master.statistics() else {
            self.diagnose(
                LogLevel::Info,
                "run.skipped_empty",
                json!({ "run_id": run.id, "sequence": run.sequence }),
            );
            return RunOutcome::Skipped;
        };

        let volume_count = self.geometry.volume_count();
        let run_index = self.report_counter;
        self.report_counter += 1;
        let slot = self.selection_slot(run_index, volume_count);

        // dose is scored against detector 0 while the mass column follows the counter
        let dose_mass = self.geometry.detectors()[0].mass_kg;
        let record = ReportRecord {
            run_index,
            events: stats.events,
            run_condition: self.run_condition.clone(),
            absorber_mass_kg: self.geometry.absorbers()[slot].mass_kg,
            dose_gy: dose_gray(stats.sum, dose_mass),
            dose_uncertainty_gy: dose_gray(stats.rms, dose_mass),
            volume_count,
        };

        if self.echo_stdout {
            println!("\n{GLOBAL_RUN_BANNER}{}", record.transcript_block());
        }

        let mut progress = AppendProgress::default();
        match self.sink.append_remaining(&record, &mut progress) {
            Ok(()) => {
                self.diagnose(
                    LogLevel::Info,
                    "run.end",
                    json!({
                        "run_id": run.id,
                        "run_index": run_index,
                        "events": stats.events,
                        "mean_mev": stats.mean,
                        "rms_mev": stats.rms,
                        "dose_gy": record.dose_gy,
                    }),
                );
                RunOutcome::Reported(record)
            }
            Err(err) => {
                let error = err.to_string();
                self.diagnose(
                    LogLevel::Error,
                    "report.write_failed",
                    json!({ "run_index": run_index, "error": error }),
                );
                self.pending.push(PendingReport {
                    record: record.clone(),
                    progress,
                });
                RunOutcome::WriteFailed { record, error }
            }
        }
    }

    fn selection_slot(&self, run_index: u64, volume_count: usize) -> usize {
        let count = volume_count as u64;
        if run_index >= count {
            self.diagnose(
                LogLevel::Warn,
                "selection.wrapped",
                json!({ "run_index": run_index, "volume_count": volume_count }),
            );
        }
        usize::try_from(run_index % count).unwrap_or_default()
    }

    /// Retries the writes of pending records in run order. Returns the records now written.
    ///
    /// Stops at the first failure, leaving it and later records pending.
    pub fn retry_pending_reports(&mut self) -> Result<Vec<ReportRecord>, ReportError> {
        let mut written = Vec::new();
        while let Some(pending) = self.pending.first_mut() {
            self.sink
                .append_remaining(&pending.record, &mut pending.progress)?;
            let done = self.pending.remove(0);
            self.diagnose(
                LogLevel::Info,
                "report.retry",
                json!({ "run_index": done.record.run_index }),
            );
            written.push(done.record);
        }
        Ok(written)
    }

    fn expect_state(
        &self,
        expected: ControllerState,
        callback: &'static str,
    ) -> Result<(), ControllerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ControllerError::InvalidTransition {
                callback,
                state: self.state,
            })
        }
    }

    fn diagnose(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        } else if level >= LogLevel::Warn {
            let record = LogRecord::new("controller", level, message).with_metadata(&metadata);
            let _ = DiagnosticLogger::stderr(LogLevel::Warn).log(&record);
        }
    }
}

impl RunHooks for RunController {
    type Outcome = RunOutcome;

    fn on_run_begin(&mut self, run: &RunDescriptor, controls: &mut EngineControls) -> Result<()> {
        Ok(self.begin_run(run, controls)?)
    }

    fn on_event(&mut self, energy_deposit: f64) {
        self.record_event(energy_deposit);
    }

    fn on_worker_merge(&mut self, worker: &RunAccumulator) {
        self.merge_worker(worker);
    }

    fn on_run_end(&mut self, run: &RunDescriptor) -> Result<RunOutcome> {
        Ok(self.end_run(run)?)
    }

    fn on_run_abort(&mut self, run: &RunDescriptor) {
        self.abort_run(run);
    }
}
