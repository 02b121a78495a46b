use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accumulator::RunAccumulator;

/// Identity of one run as seen by the hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDescriptor {
    /// Unique run id.
    pub id: Uuid,
    /// Engine-side run number, counting every run including empty ones.
    pub sequence: u64,
    /// Events requested for the run.
    pub requested_events: u64,
    /// Master seed used for the run.
    pub seed: u64,
}

impl RunDescriptor {
    /// Creates a descriptor with a fresh id.
    #[must_use]
    pub fn new(sequence: u64, requested_events: u64, seed: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            requested_events,
            seed,
        }
    }
}

/// Switches the hooks may flip on the engine at run begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineControls {
    /// Persist the run's random seed to `currentRun.rndm`.
    pub random_number_store: bool,
}

impl Default for EngineControls {
    fn default() -> Self {
        Self {
            random_number_store: true,
        }
    }
}

/// Run lifecycle callbacks invoked by the engine.
///
/// `on_event` is used when events run on the calling thread; with worker
/// threads each worker tallies privately and `on_worker_merge` is called once
/// per worker after all of them have finished. A run that fails after
/// `on_run_begin` gets `on_run_abort` instead of `on_run_end`.
pub trait RunHooks {
    /// Value returned at run end.
    type Outcome;

    /// Called before any event of the run.
    fn on_run_begin(&mut self, run: &RunDescriptor, controls: &mut EngineControls) -> Result<()>;

    /// Called for each event that deposited energy.
    fn on_event(&mut self, energy_deposit: f64);

    /// Called with each worker's tally after the join.
    fn on_worker_merge(&mut self, worker: &RunAccumulator);

    /// Called after all events and merges.
    fn on_run_end(&mut self, run: &RunDescriptor) -> Result<Self::Outcome>;

    /// Called when the run failed between begin and end; no outcome is produced.
    fn on_run_abort(&mut self, run: &RunDescriptor);
}
