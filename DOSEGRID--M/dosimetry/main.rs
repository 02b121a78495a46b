use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    beam::BeamWindow,
    config::DoseGridConfig,
    controller::{RunController, RunOutcome},
    engine::{EventSource, RunManager, SyntheticBeam},
    geometry::{DetectorGeometry, GeometryBuilder},
    helper::DoseTelemetry,
    materials::MaterialTable,
    report::ReportSink,
    scan::{ScanDriver, ScanIteration, SeedStrategy},
    session::{SessionCommand, HELP},
    units::{BestUnit, UnitCategory},
};

const PROMPT: &str = "Idle> ";

/// The assembled application: geometry, controller and run manager wired to one configuration.
pub struct DoseGridApp {
    config: DoseGridConfig,
    geometry: Arc<DetectorGeometry>,
    beam_file: PathBuf,
    controller: RunController,
    manager: RunManager,
    telemetry: Option<DoseTelemetry>,
}

impl DoseGridApp {
    /// Returns a builder.
    #[must_use]
    pub fn builder(config: DoseGridConfig) -> DoseGridAppBuilder {
        DoseGridAppBuilder::new(config)
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &DoseGridConfig {
        &self.config
    }

    /// Built geometry.
    #[must_use]
    pub fn geometry(&self) -> &DetectorGeometry {
        &self.geometry
    }

    /// Run controller, for inspecting counters and pending reports.
    #[must_use]
    pub const fn controller(&self) -> &RunController {
        &self.controller
    }

    /// Beam-position file the source reads.
    #[must_use]
    pub fn beam_file(&self) -> &std::path::Path {
        &self.beam_file
    }

    /// Fires one run. Earlier unwritten reports are retried first.
    pub async fn beam_on(&mut self, events: u64) -> Result<RunOutcome> {
        self.flush_pending();
        self.manager.beam_on(events, &mut self.controller).await
    }

    /// Runs the grid scan for a dose target.
    pub async fn scan(
        &mut self,
        dose_target: f64,
        seeds: SeedStrategy,
    ) -> Result<Vec<ScanIteration<RunOutcome>>> {
        self.flush_pending();
        let driver = ScanDriver::new(
            dose_target,
            self.config.geometry.envelope_xy,
            self.geometry.grid_size(),
            &self.beam_file,
        )
        .seeds(seeds)
        .telemetry(self.telemetry.clone());
        let iterations = driver.run(&mut self.manager, &mut self.controller).await?;
        self.flush_pending();
        Ok(iterations)
    }

    /// Rewrites the beam-position file.
    pub fn set_beam_window(&self, window: BeamWindow) -> Result<()> {
        window
            .write(&self.beam_file)
            .context("updating beam position")
    }

    /// Replaces the master seed.
    pub fn reseed(&mut self, seed: u64) {
        self.manager.reseed(seed);
    }

    /// Reads commands until `exit` or end of input. Returns the number of commands executed.
    ///
    /// Bad commands are reported on `output` and the session continues; engine failures end it.
    pub async fn run_session<R, W>(&mut self, input: R, mut output: W) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut executed = 0;
        loop {
            output.write_all(PROMPT.as_bytes()).await?;
            output.flush().await?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let command = match SessionCommand::parse_line(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(err) => {
                    output.write_all(format!("{err}\n").as_bytes()).await?;
                    continue;
                }
            };
            self.log(
                LogLevel::Debug,
                "session.command",
                json!({ "command": command.to_string() }),
            );
            executed += 1;
            let reply = match command {
                SessionCommand::Exit => break,
                SessionCommand::Help => format!("{HELP}\n"),
                SessionCommand::BeamOn(events) => describe(&self.beam_on(events).await?),
                SessionCommand::GunPosition(window) => {
                    self.set_beam_window(window)?;
                    format!("beam window set to {}\n", window.to_line())
                }
                SessionCommand::SetSeed(seed) => {
                    self.reseed(seed);
                    format!("master seed set to {seed}\n")
                }
            };
            output.write_all(reply.as_bytes()).await?;
        }
        output.flush().await?;
        Ok(executed)
    }

    fn flush_pending(&mut self) {
        if self.controller.pending_reports().is_empty() {
            return;
        }
        if let Err(err) = self.controller.retry_pending_reports() {
            self.log(
                LogLevel::Warn,
                "report.retry",
                json!({ "pending": self.controller.pending_reports().len(), "error": err.to_string() }),
            );
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

fn describe(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Skipped => "run skipped: no energy deposited\n".into(),
        RunOutcome::Reported(record) => format!(
            "run {}: {} events, dose {} +- {}\n",
            record.run_index,
            record.events,
            BestUnit::new(record.dose_gy, UnitCategory::Dose),
            BestUnit::new(record.dose_uncertainty_gy, UnitCategory::Dose),
        ),
        RunOutcome::WriteFailed { record, error } => format!(
            "run {}: report kept for retry ({error})\n",
            record.run_index
        ),
    }
}

/// Primary description as it appears in the transcript, e.g. `gamma of 6 MeV`.
#[must_use]
pub fn run_condition(particle: &str, energy_mev: f64) -> String {
    format!("{particle} of {}", BestUnit::new(energy_mev, UnitCategory::Energy))
        .trim_end()
        .to_string()
}

/// Builder for [`DoseGridApp`].
pub struct DoseGridAppBuilder {
    config: DoseGridConfig,
    telemetry: Option<DoseTelemetry>,
    source: Option<Arc<dyn EventSource>>,
    echo: bool,
}

impl DoseGridAppBuilder {
    /// Starts from a configuration.
    #[must_use]
    pub fn new(config: DoseGridConfig) -> Self {
        Self {
            config,
            telemetry: None,
            source: None,
            echo: false,
        }
    }

    /// Uses this telemetry instead of one built from `[output]`.
    #[must_use]
    pub fn telemetry(mut self, telemetry: DoseTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Replaces the synthetic beam with another event source.
    #[must_use]
    pub fn event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Echoes each run's transcript block to stdout.
    #[must_use]
    pub const fn stdout_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Builds the geometry, resets the report files, writes the default beam window
    /// and wires controller and run manager.
    pub fn build(self) -> Result<DoseGridApp> {
        let config = self.config;
        config.validate().context("validating configuration")?;

        let telemetry = match self.telemetry {
            Some(telemetry) => telemetry,
            None => {
                let mut builder =
                    DoseTelemetry::builder("dosegrid").min_level(config.output.log_level);
                if let Some(path) = &config.output.log_path {
                    builder = builder.log_path(path);
                }
                builder.build().context("opening diagnostic log")?
            }
        };

        let materials = MaterialTable::nist();
        let geometry = Arc::new(
            GeometryBuilder::new(config.geometry.clone(), materials.clone())
                .build()
                .context("building detector geometry")?,
        );

        let sink = ReportSink::in_dir(&config.output.directory);
        sink.truncate().context("resetting report files")?;

        let beam_file = config.beam_file();
        BeamWindow::default()
            .write(&beam_file)
            .context("writing default beam position")?;

        let condition = run_condition(&config.beam.particle, config.beam.energy_mev);
        let controller = RunController::new(
            Arc::clone(&geometry),
            sink,
            condition,
            Some(telemetry.clone()),
        )?
        .with_stdout_echo(self.echo);

        let source = self.source.unwrap_or_else(|| {
            Arc::new(SyntheticBeam::new(
                Arc::clone(&geometry),
                materials,
                config.beam.energy_mev,
                &beam_file,
            ))
        });
        let mut manager = RunManager::new(source, config.run.threads)
            .with_state_dir(&config.output.directory)
            .with_telemetry(Some(telemetry.clone()));
        if let Some(seed) = config.run.seed {
            manager.reseed(seed);
        }

        let _ = telemetry.info(
            "app.ready",
            json!({
                "volumes": geometry.volume_count(),
                "threads": manager.threads(),
                "beam_file": beam_file.display().to_string(),
            }),
        );

        Ok(DoseGridApp {
            config,
            geometry,
            beam_file,
            controller,
            manager,
            telemetry: Some(telemetry),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::source::ReplaySource, report::TABLE_FILE};
    use std::fs;
    use tempfile::tempdir;
    use tokio::io::BufReader;

    fn config(dir: &std::path::Path) -> DoseGridConfig {
        let mut config = DoseGridConfig::default();
        config.output.directory = dir.to_path_buf();
        config.output.log_path = Some(dir.join("dosegrid.log"));
        config.run.threads = 1;
        config.run.seed = Some(21);
        config
    }

    fn app(dir: &std::path::Path) -> DoseGridApp {
        DoseGridApp::builder(config(dir))
            .event_source(Arc::new(ReplaySource {
                deposits: vec![0.0, 2.0, 4.0],
            }))
            .build()
            .unwrap()
    }

    #[test]
    fn run_condition_uses_best_unit() {
        assert_eq!(run_condition("gamma", 6.0), "gamma of 6 MeV");
        assert_eq!(run_condition("e-", 0.5), "e- of 500 keV");
    }

    #[tokio::test]
    async fn startup_resets_outputs_and_writes_default_beam() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(TABLE_FILE), "stale\r\n").unwrap();
        let mut app = app(dir.path());
        assert_eq!(fs::read_to_string(dir.path().join(TABLE_FILE)).unwrap(), "");
        assert_eq!(
            BeamWindow::read(app.beam_file()).unwrap(),
            BeamWindow::default()
        );

        let outcome = app.beam_on(200).await.unwrap();
        assert_eq!(outcome.record().unwrap().run_index, 0);
        let table = fs::read_to_string(dir.path().join(TABLE_FILE)).unwrap();
        assert_eq!(table.lines().count(), 1);
        let log = fs::read_to_string(dir.path().join("dosegrid.log")).unwrap();
        assert!(log.contains("app.ready"));
        assert!(log.contains("run.end"));
    }

    #[tokio::test]
    async fn session_executes_until_exit() {
        let dir = tempdir().unwrap();
        let mut app = app(dir.path());
        let script = "help\n# comment\n/run/beamOn 50\nbogus\n/gun/position -40 1 -15 1\n/random/setSeeds 3\nexit\n/run/beamOn 50\n";
        let mut output = Vec::new();
        let executed = app
            .run_session(BufReader::new(script.as_bytes()), &mut output)
            .await
            .unwrap();
        let output = String::from_utf8(output).unwrap();

        assert_eq!(executed, 5);
        assert!(output.contains("/run/beamOn N"));
        assert!(output.contains("run 0: "));
        assert!(output.contains("command not found: `bogus`"));
        assert!(output.contains("master seed set to 3"));
        assert_eq!(
            BeamWindow::read(app.beam_file()).unwrap(),
            BeamWindow::new(-40.0, 1.0, -15.0, 1.0)
        );
        assert_eq!(app.controller().report_counter(), 1);
    }

    #[tokio::test]
    async fn scan_covers_the_grid() {
        let dir = tempdir().unwrap();
        let mut app = app(dir.path());
        let iterations = app.scan(0.3, SeedStrategy::Fixed(1)).await.unwrap();
        assert_eq!(iterations.len(), 16);
        assert!(iterations.iter().all(|it| it.events > 0 && it.outcome.is_ok()));
        let table = fs::read_to_string(dir.path().join(TABLE_FILE)).unwrap();
        assert_eq!(table.lines().count(), 16);
    }

    #[test]
    fn invalid_geometry_is_fatal() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.geometry.array_material = "G4_UNOBTAINIUM".into();
        assert!(DoseGridApp::builder(config).build().is_err());
    }
}
