use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    beam::BeamWindow,
    engine::{RunHooks, RunManager},
    helper::{seeded_rng, wall_clock_seed, DoseTelemetry},
};

/// Events fired per 30 units of dose target.
const EVENTS_PER_30_UNITS: f64 = 50_000.0;
const JITTER_SIGMA: f64 = 0.05;
const JITTER_SCALE: f64 = 0.2;

/// Parses the scan argument the way `atof` does: longest numeric prefix, else zero.
#[must_use]
pub fn parse_dose_target(input: &str) -> f64 {
    let trimmed = input.trim_start();
    (1..=trimmed.len())
        .rev()
        .filter(|end| trimmed.is_char_boundary(*end))
        .find_map(|end| trimmed[..end].parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Un-jittered event count for a dose target.
#[must_use]
pub fn nominal_events(target: f64) -> f64 {
    (target * EVENTS_PER_30_UNITS / 30.0).trunc()
}

/// Event count for one scan iteration: the nominal count reduced by up to
/// `0.2·|g|` with `g ~ N(0, 0.05)`, made non-negative and truncated.
pub fn jittered_events<R: Rng + ?Sized>(target: f64, rng: &mut R) -> u64 {
    let nominal = nominal_events(target);
    let gauss: f64 = rng.sample::<f64, _>(StandardNormal) * JITTER_SIGMA;
    let events = (nominal - JITTER_SCALE * nominal * gauss.abs()).abs();
    if events.is_finite() {
        // saturating float-to-int conversion
        events as u64
    } else {
        0
    }
}

/// Where each iteration's seed comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedStrategy {
    /// Wall-clock seconds at the start of the iteration.
    WallClock,
    /// `base + iteration`, for reproducible scans.
    Fixed(u64),
}

impl SeedStrategy {
    /// Seed for a given iteration.
    #[must_use]
    pub fn seed_for(self, iteration: usize) -> u64 {
        match self {
            Self::WallClock => wall_clock_seed(),
            Self::Fixed(base) => base.wrapping_add(u64::try_from(iteration).unwrap_or(u64::MAX)),
        }
    }
}

/// One scan iteration, completed or failed.
#[derive(Debug, Clone)]
pub struct ScanIteration<O> {
    /// Iteration number, `i * grid_size + j`.
    pub index: usize,
    /// Grid cell fired at.
    pub cell: (usize, usize),
    /// Window written to the beam file.
    pub window: BeamWindow,
    /// Seed the iteration ran with.
    pub seed: u64,
    /// Events requested.
    pub events: u64,
    /// What the hooks returned, or the error that ended the iteration.
    pub outcome: Result<O, String>,
}

/// Batch mode: one run per grid cell with the beam narrowed onto it.
#[derive(Debug, Clone)]
pub struct ScanDriver {
    dose_target: f64,
    envelope_xy: f64,
    grid_size: usize,
    beam_file: PathBuf,
    seeds: SeedStrategy,
    telemetry: Option<DoseTelemetry>,
}

impl ScanDriver {
    /// Creates a driver for a `grid_size`² lattice inside an envelope of width `envelope_xy` cm.
    #[must_use]
    pub fn new(
        dose_target: f64,
        envelope_xy: f64,
        grid_size: usize,
        beam_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dose_target,
            envelope_xy,
            grid_size,
            beam_file: beam_file.into(),
            seeds: SeedStrategy::WallClock,
            telemetry: None,
        }
    }

    /// Overrides the seed source.
    #[must_use]
    pub const fn seeds(mut self, seeds: SeedStrategy) -> Self {
        self.seeds = seeds;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Option<DoseTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Number of runs the scan performs.
    #[must_use]
    pub const fn iterations(&self) -> usize {
        self.grid_size * self.grid_size
    }

    /// Runs the scan, `i` outer and `j` inner.
    ///
    /// A cell whose beam file cannot be written or whose run fails is recorded
    /// with its error and the scan moves on to the next cell.
    pub async fn run<H: RunHooks>(
        &self,
        manager: &mut RunManager,
        hooks: &mut H,
    ) -> Result<Vec<ScanIteration<H::Outcome>>> {
        let mut iterations = Vec::with_capacity(self.iterations());
        for i in 0..self.grid_size {
            for j in 0..self.grid_size {
                let index = i * self.grid_size + j;
                let window = BeamWindow::scan_cell(self.envelope_xy, self.grid_size, i, j);
                let seed = self.seeds.seed_for(index);
                let events = jittered_events(self.dose_target, &mut seeded_rng(seed));
                let outcome = self
                    .fire(manager, hooks, (i, j), &window, seed, events)
                    .await
                    .map_err(|err| format!("{err:#}"));

                if let Some(tel) = &self.telemetry {
                    let _ = match &outcome {
                        Ok(_) => tel.info(
                            "scan.iteration",
                            json!({
                                "index": index,
                                "cell": [i, j],
                                "x_min": window.x_min,
                                "y_min": window.y_min,
                                "seed": seed,
                                "events": events,
                            }),
                        ),
                        Err(error) => tel.warn(
                            "scan.iteration_failed",
                            json!({
                                "index": index,
                                "cell": [i, j],
                                "seed": seed,
                                "events": events,
                                "error": error,
                            }),
                        ),
                    };
                }
                iterations.push(ScanIteration {
                    index,
                    cell: (i, j),
                    window,
                    seed,
                    events,
                    outcome,
                });
            }
        }
        Ok(iterations)
    }

    async fn fire<H: RunHooks>(
        &self,
        manager: &mut RunManager,
        hooks: &mut H,
        (i, j): (usize, usize),
        window: &BeamWindow,
        seed: u64,
        events: u64,
    ) -> Result<H::Outcome> {
        window
            .write(&self.beam_file)
            .with_context(|| format!("positioning beam for cell ({i}, {j})"))?;
        manager.reseed(seed);
        manager
            .beam_on(events, hooks)
            .await
            .with_context(|| format!("scan iteration {}", i * self.grid_size + j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        beam::BEAM_FILE,
        controller::{RunController, RunOutcome},
        engine::{source::ReplaySource, EventGenerator, EventSource},
        geometry::{GeometryBuilder, GeometrySpec},
        materials::MaterialTable,
        report::ReportSink,
    };
    use parking_lot::Mutex;
    use std::{
        fs,
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tempfile::tempdir;

    #[test]
    fn parses_numeric_prefix_like_atof() {
        assert!((parse_dose_target("30") - 30.0).abs() < f64::EPSILON);
        assert!((parse_dose_target("  2.5Gy") - 2.5).abs() < f64::EPSILON);
        assert!((parse_dose_target("1e") - 1.0).abs() < f64::EPSILON);
        assert!(parse_dose_target("abc").abs() < f64::EPSILON);
        assert!(parse_dose_target("").abs() < f64::EPSILON);
    }

    #[test]
    fn nominal_count_truncates() {
        assert!((nominal_events(30.0) - 50_000.0).abs() < f64::EPSILON);
        assert!((nominal_events(1.0) - 1_666.0).abs() < f64::EPSILON);
    }

    #[test]
    fn jitter_only_reduces_the_count() {
        let mut rng = seeded_rng(17);
        for _ in 0..200 {
            let events = jittered_events(30.0, &mut rng);
            assert!(events <= 50_000);
            assert!(events >= 45_000);
        }
        assert_eq!(jittered_events(0.0, &mut rng), 0);
    }

    #[test]
    fn fixed_seeds_reproduce_the_jitter() {
        let seeds = SeedStrategy::Fixed(123);
        let first: Vec<u64> = (0..16)
            .map(|k| jittered_events(12.0, &mut seeded_rng(seeds.seed_for(k))))
            .collect();
        let second: Vec<u64> = (0..16)
            .map(|k| jittered_events(12.0, &mut seeded_rng(seeds.seed_for(k))))
            .collect();
        assert_eq!(first, second);
        assert_eq!(seeds.seed_for(3), 126);
    }

    /// Reads the beam file at every run start, the way the transport side does.
    struct WindowRecorder {
        beam_file: PathBuf,
        failing_run: Option<usize>,
        runs: AtomicUsize,
        seen: Mutex<Vec<BeamWindow>>,
        deposits: ReplaySource,
    }

    impl WindowRecorder {
        fn new(beam_file: PathBuf, failing_run: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                beam_file,
                failing_run,
                runs: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                deposits: ReplaySource {
                    deposits: vec![1.0],
                },
            })
        }
    }

    impl EventSource for WindowRecorder {
        fn begin_run(&self) -> Result<Arc<dyn EventGenerator>> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.failing_run == Some(run) {
                anyhow::bail!("transport setup failed for run {run}");
            }
            self.seen.lock().push(BeamWindow::read(&self.beam_file)?);
            self.deposits.begin_run()
        }
    }

    fn controller(dir: &Path) -> (RunController, ReportSink) {
        let geometry = Arc::new(
            GeometryBuilder::new(GeometrySpec::default(), MaterialTable::nist())
                .build()
                .unwrap(),
        );
        let sink = ReportSink::in_dir(dir);
        sink.truncate().unwrap();
        let controller = RunController::new(geometry, sink.clone(), "gamma of 6 MeV", None).unwrap();
        (controller, sink)
    }

    #[tokio::test]
    async fn scan_positions_the_beam_before_every_run() {
        let dir = tempdir().unwrap();
        let beam_file = dir.path().join(BEAM_FILE);
        let (mut controller, sink) = controller(dir.path());
        let recorder = WindowRecorder::new(beam_file.clone(), None);
        let mut manager = RunManager::new(recorder.clone(), 4);

        let driver = ScanDriver::new(parse_dose_target("30"), 100.0, 4, &beam_file)
            .seeds(SeedStrategy::Fixed(5));
        let iterations = driver.run(&mut manager, &mut controller).await.unwrap();

        let expected: Vec<BeamWindow> = (0..4)
            .flat_map(|i| (0..4).map(move |j| BeamWindow::scan_cell(100.0, 4, i, j)))
            .collect();
        assert_eq!(*recorder.seen.lock(), expected);

        assert_eq!(iterations.len(), 16);
        for (expected, iteration) in iterations.iter().enumerate() {
            assert_eq!(iteration.index, expected);
            assert_eq!(iteration.cell, (expected / 4, expected % 4));
            assert!(iteration.events >= 45_000 && iteration.events <= 50_000);
            let Ok(RunOutcome::Reported(record)) = &iteration.outcome else {
                panic!("iteration {expected} was not reported");
            };
            assert_eq!(record.run_index, expected as u64);
            assert_eq!(record.events, iteration.events);
        }
        let table = fs::read_to_string(sink.table_path()).unwrap();
        assert_eq!(table.lines().count(), 16);
        assert!(table.lines().last().unwrap().starts_with("15\t"));
        let transcript = fs::read_to_string(sink.transcript_path()).unwrap();
        assert_eq!(transcript.matches("Dose in scoring volume").count(), 16);
    }

    #[tokio::test]
    async fn failed_cell_does_not_stop_the_scan() {
        let dir = tempdir().unwrap();
        let beam_file = dir.path().join(BEAM_FILE);
        let (mut controller, sink) = controller(dir.path());
        let recorder = WindowRecorder::new(beam_file.clone(), Some(3));
        let mut manager = RunManager::new(recorder.clone(), 2);

        let driver = ScanDriver::new(0.06, 100.0, 4, &beam_file).seeds(SeedStrategy::Fixed(5));
        let iterations = driver.run(&mut manager, &mut controller).await.unwrap();

        assert_eq!(iterations.len(), 16);
        let failed: Vec<usize> = iterations
            .iter()
            .filter(|iteration| iteration.outcome.is_err())
            .map(|iteration| iteration.index)
            .collect();
        assert_eq!(failed, vec![3]);
        let error = iterations[3].outcome.as_ref().unwrap_err();
        assert!(error.contains("scan iteration 3"));
        assert!(error.contains("transport setup failed"));

        let reported: Vec<u64> = iterations
            .iter()
            .filter_map(|iteration| iteration.outcome.as_ref().ok()?.record())
            .map(|record| record.run_index)
            .collect();
        assert_eq!(reported, (0..15).collect::<Vec<u64>>());
        assert_eq!(recorder.seen.lock().len(), 15);
        assert_eq!(
            BeamWindow::read(&beam_file).unwrap(),
            BeamWindow::scan_cell(100.0, 4, 3, 3)
        );
        let table = fs::read_to_string(sink.table_path()).unwrap();
        assert_eq!(table.lines().count(), 15);
    }
}
