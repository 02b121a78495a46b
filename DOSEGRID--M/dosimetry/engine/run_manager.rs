use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use futures::future::try_join_all;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    accumulator::RunAccumulator,
    engine::{
        hooks::{EngineControls, RunDescriptor, RunHooks},
        source::{EventGenerator, EventSource},
    },
    helper::{random_seed, seeded_rng, DoseTelemetry},
};

/// File the random-engine status is persisted to while the store flag is on.
pub const RANDOM_STATUS_FILE: &str = "currentRun.rndm";

/// Drives runs: prepares the generator, splits events over workers and feeds the hooks.
pub struct RunManager {
    source: Arc<dyn EventSource>,
    threads: usize,
    master_seed: u64,
    next_sequence: u64,
    controls: EngineControls,
    state_dir: Option<PathBuf>,
    telemetry: Option<DoseTelemetry>,
}

impl fmt::Debug for RunManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunManager")
            .field("threads", &self.threads)
            .field("master_seed", &self.master_seed)
            .field("next_sequence", &self.next_sequence)
            .field("controls", &self.controls)
            .finish_non_exhaustive()
    }
}

impl RunManager {
    /// Creates a manager with a random master seed. `threads` below one is treated as one.
    #[must_use]
    pub fn new(source: Arc<dyn EventSource>, threads: usize) -> Self {
        Self {
            source,
            threads: threads.max(1),
            master_seed: random_seed(),
            next_sequence: 0,
            controls: EngineControls::default(),
            state_dir: None,
            telemetry: None,
        }
    }

    /// Directory the random status is written to.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Option<DoseTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Replaces the master seed used by subsequent runs.
    pub fn reseed(&mut self, seed: u64) {
        self.master_seed = seed;
    }

    /// Current master seed.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.master_seed
    }

    /// Worker count.
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    /// Engine switches as left by the last run.
    #[must_use]
    pub const fn controls(&self) -> EngineControls {
        self.controls
    }

    /// Runs started so far.
    #[must_use]
    pub const fn runs_started(&self) -> u64 {
        self.next_sequence
    }

    /// Fires `events` primaries and returns what the hooks produce at run end.
    ///
    /// With one thread every scoring deposit goes through `on_event`; otherwise
    /// each worker tallies on its own and the tallies are merged in worker order.
    /// If a worker fails the hooks get `on_run_abort` and the error is returned.
    pub async fn beam_on<H: RunHooks>(&mut self, events: u64, hooks: &mut H) -> Result<H::Outcome> {
        let generator = self.source.begin_run()?;
        let run = RunDescriptor::new(self.next_sequence, events, self.master_seed);
        self.next_sequence += 1;

        hooks.on_run_begin(&run, &mut self.controls)?;
        if self.controls.random_number_store {
            self.store_random_status(&run).await;
        }

        if let Err(err) = self.fire(&run, generator, hooks).await {
            hooks.on_run_abort(&run);
            return Err(err);
        }
        hooks.on_run_end(&run)
    }

    async fn fire<H: RunHooks>(
        &self,
        run: &RunDescriptor,
        generator: Arc<dyn EventGenerator>,
        hooks: &mut H,
    ) -> Result<()> {
        if self.threads == 1 {
            let mut rng = seeded_rng(run.seed);
            for _ in 0..run.requested_events {
                let edep = generator.simulate_event(&mut rng);
                if edep > 0.0 {
                    hooks.on_event(edep);
                }
            }
        } else {
            for tally in self.run_workers(run, generator).await? {
                hooks.on_worker_merge(&tally);
            }
        }
        Ok(())
    }

    async fn run_workers(
        &self,
        run: &RunDescriptor,
        generator: Arc<dyn EventGenerator>,
    ) -> Result<Vec<RunAccumulator>> {
        let shares = split_events(run.requested_events, self.threads);
        self.log(
            LogLevel::Debug,
            "run.workers",
            json!({ "run_id": run.id, "shares": shares }),
        );
        let workers = shares
            .into_iter()
            .zip(0u64..)
            .filter(|(share, _)| *share > 0)
            .map(|(share, worker)| {
                let generator = Arc::clone(&generator);
                let seed = run.seed.wrapping_add(worker);
                tokio::task::spawn_blocking(move || {
                    let mut rng = seeded_rng(seed);
                    let mut tally = RunAccumulator::new();
                    for _ in 0..share {
                        let edep = generator.simulate_event(&mut rng);
                        if edep > 0.0 {
                            tally.add_event(edep);
                        }
                    }
                    tally
                })
            });
        try_join_all(workers)
            .await
            .context("event worker did not finish")
    }

    async fn store_random_status(&self, run: &RunDescriptor) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        let path = dir.join(RANDOM_STATUS_FILE);
        if let Err(err) = write_status(&path, run).await {
            self.log(
                LogLevel::Warn,
                "run.random_status_failed",
                json!({ "path": path.display().to_string(), "error": err.to_string() }),
            );
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

async fn write_status(path: &Path, run: &RunDescriptor) -> Result<()> {
    let body = format!("run {}\nseed {}\n", run.sequence, run.seed);
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Splits `events` over `workers` as evenly as possible; earlier workers take the remainder.
#[must_use]
pub fn split_events(events: u64, workers: usize) -> Vec<u64> {
    let workers = u64::try_from(workers.max(1)).unwrap_or(1);
    let base = events / workers;
    let extra = events % workers;
    (0..workers)
        .map(|worker| base + u64::from(worker < extra))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controller::{ControllerState, RunController, RunOutcome},
        engine::source::ReplaySource,
        geometry::{GeometryBuilder, GeometrySpec},
        materials::MaterialTable,
        report::ReportSink,
    };
    use rand::rngs::SmallRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Tally {
        keep_store: bool,
        begun: u32,
        aborted: u32,
        per_event: u64,
        merged: usize,
        master: RunAccumulator,
    }

    impl RunHooks for Tally {
        type Outcome = RunAccumulator;

        fn on_run_begin(
            &mut self,
            _run: &RunDescriptor,
            controls: &mut EngineControls,
        ) -> Result<()> {
            self.begun += 1;
            controls.random_number_store = self.keep_store;
            self.master.reset();
            Ok(())
        }

        fn on_event(&mut self, energy_deposit: f64) {
            self.per_event += 1;
            self.master.add_event(energy_deposit);
        }

        fn on_worker_merge(&mut self, worker: &RunAccumulator) {
            self.merged += 1;
            self.master.merge(worker);
        }

        fn on_run_end(&mut self, _run: &RunDescriptor) -> Result<RunAccumulator> {
            Ok(self.master)
        }

        fn on_run_abort(&mut self, _run: &RunDescriptor) {
            self.aborted += 1;
            self.master.reset();
        }
    }

    /// Every event of the first run panics; later runs deposit 1 MeV per event.
    #[derive(Default)]
    struct LostFirstReadout {
        runs: AtomicUsize,
    }

    impl EventSource for LostFirstReadout {
        fn begin_run(&self) -> Result<Arc<dyn EventGenerator>> {
            let broken = self.runs.fetch_add(1, Ordering::SeqCst) == 0;
            Ok(Arc::new(Readout { broken }))
        }
    }

    struct Readout {
        broken: bool,
    }

    impl EventGenerator for Readout {
        fn simulate_event(&self, _rng: &mut SmallRng) -> f64 {
            assert!(!self.broken, "detector readout lost");
            1.0
        }
    }

    fn manager(deposits: Vec<f64>, threads: usize) -> RunManager {
        RunManager::new(Arc::new(ReplaySource { deposits }), threads)
    }

    #[test]
    fn splits_events_evenly() {
        assert_eq!(split_events(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(split_events(2, 4), vec![1, 1, 0, 0]);
        assert_eq!(split_events(7, 0), vec![7]);
    }

    #[tokio::test]
    async fn single_thread_feeds_every_scoring_event() {
        let mut manager = manager(vec![0.0, 1.0, 2.0], 1);
        manager.reseed(11);
        let mut hooks = Tally::default();
        let tally = manager.beam_on(3_000, &mut hooks).await.unwrap();
        assert_eq!(hooks.per_event, tally.events());
        assert_eq!(hooks.merged, 0);
        assert!(tally.events() > 0 && tally.events() < 3_000);
    }

    #[tokio::test]
    async fn workers_merge_all_events() {
        let mut manager = manager(vec![1.0], 4);
        let mut hooks = Tally::default();
        let tally = manager.beam_on(1_001, &mut hooks).await.unwrap();
        assert_eq!(tally.events(), 1_001);
        assert!((tally.sum() - 1_001.0).abs() < 1e-9);
        assert_eq!(hooks.merged, 4);
        assert_eq!(hooks.per_event, 0);
    }

    #[tokio::test]
    async fn fixed_seed_reproduces_the_run() {
        let mut first = manager(vec![0.0, 0.5, 2.5, 4.0], 3);
        let mut second = manager(vec![0.0, 0.5, 2.5, 4.0], 3);
        first.reseed(99);
        second.reseed(99);
        let a = first.beam_on(5_000, &mut Tally::default()).await.unwrap();
        let b = second.beam_on(5_000, &mut Tally::default()).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn random_status_follows_the_store_flag() {
        let dir = tempdir().unwrap();
        let status = dir.path().join(RANDOM_STATUS_FILE);

        let mut manager = manager(vec![1.0], 1).with_state_dir(dir.path());
        manager
            .beam_on(5, &mut Tally::default())
            .await
            .unwrap();
        assert!(!status.exists());

        let mut keeper = Tally {
            keep_store: true,
            ..Tally::default()
        };
        manager.reseed(5);
        manager.beam_on(5, &mut keeper).await.unwrap();
        let body = std::fs::read_to_string(&status).unwrap();
        assert!(body.contains("seed 5"));
        assert_eq!(manager.runs_started(), 2);
    }

    #[tokio::test]
    async fn zero_events_still_complete_the_run() {
        let mut manager = manager(vec![1.0], 2);
        let mut hooks = Tally::default();
        let tally = manager.beam_on(0, &mut hooks).await.unwrap();
        assert_eq!(hooks.begun, 1);
        assert_eq!(tally.events(), 0);
    }

    #[tokio::test]
    async fn worker_failure_aborts_the_run() {
        let mut manager = RunManager::new(Arc::new(LostFirstReadout::default()), 2);
        let mut hooks = Tally::default();
        let err = manager.beam_on(100, &mut hooks).await.unwrap_err();
        assert!(format!("{err:#}").contains("event worker did not finish"));
        assert_eq!((hooks.begun, hooks.aborted), (1, 1));

        let tally = manager.beam_on(100, &mut hooks).await.unwrap();
        assert_eq!(tally.events(), 100);
        assert_eq!((hooks.begun, hooks.aborted), (2, 1));
    }

    #[tokio::test]
    async fn controller_accepts_the_run_after_a_failed_one() {
        let dir = tempdir().unwrap();
        let geometry = Arc::new(
            GeometryBuilder::new(GeometrySpec::default(), MaterialTable::nist())
                .build()
                .unwrap(),
        );
        let sink = ReportSink::in_dir(dir.path());
        sink.truncate().unwrap();
        let mut controller =
            RunController::new(geometry, sink.clone(), "gamma of 6 MeV", None).unwrap();
        let mut manager = RunManager::new(Arc::new(LostFirstReadout::default()), 2);

        assert!(manager.beam_on(50, &mut controller).await.is_err());
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.accumulator().events(), 0);

        let outcome = manager.beam_on(50, &mut controller).await.unwrap();
        let RunOutcome::Reported(record) = outcome else {
            panic!("run after the failure was not reported");
        };
        assert_eq!(record.run_index, 0);
        assert_eq!(record.events, 50);
        let table = std::fs::read_to_string(sink.table_path()).unwrap();
        assert_eq!(table.lines().count(), 1);
    }
}
