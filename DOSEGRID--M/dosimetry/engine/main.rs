//! Engine side of the run loop: hook interface, multi-worker run manager and event sources.

/// Callbacks the run manager drives and the descriptors it hands out.
pub mod hooks;
/// Splits runs over workers, joins them and merges their tallies.
pub mod run_manager;
/// Event source seam and the synthetic beam stand-in.
pub mod source;

pub use hooks::{EngineControls, RunDescriptor, RunHooks};
pub use run_manager::RunManager;
pub use source::{EventGenerator, EventSource, SyntheticBeam};
