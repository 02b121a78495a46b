#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Dosegrid dosimetry – absorber/detector grid geometry, per-run dose accumulation across
//! worker threads, and the transcript/table report files.

/// Telemetry handle and seeding helpers.
#[path = "../helper.rs"]
pub mod helper;

/// Best-unit formatting for energy, mass and dose.
#[path = "../units.rs"]
pub mod units;

/// Material table.
#[path = "../materials.rs"]
pub mod materials;

/// Grid construction and volume lookup.
#[path = "../geometry.rs"]
pub mod geometry;

/// Count, sum and sum-of-squares tallies.
#[path = "../accumulator.rs"]
pub mod accumulator;

/// Report records and the append-only sink.
#[path = "../report.rs"]
pub mod report;

/// Run lifecycle, dose statistics and report dispatch.
#[path = "../controller.rs"]
pub mod controller;

/// Run hooks, worker fan-out and event sources.
#[path = "../engine/main.rs"]
pub mod engine;

/// Beam-position file.
#[path = "../beam.rs"]
pub mod beam;

/// Batch scan over the grid cells.
#[path = "../scan.rs"]
pub mod scan;

/// Interactive command parsing.
#[path = "../session.rs"]
pub mod session;

/// TOML configuration and environment overrides.
#[path = "../config.rs"]
pub mod config;

/// Application wiring & session loop.
#[path = "../main.rs"]
pub mod runtime;

pub use accumulator::{RunAccumulator, RunStatistics};
pub use beam::BeamWindow;
pub use config::{ConfigError, DoseGridConfig};
pub use controller::{ControllerError, RunController, RunOutcome};
pub use engine::{EngineControls, EventSource, RunDescriptor, RunHooks, RunManager, SyntheticBeam};
pub use geometry::{DetectorGeometry, GeometryBuilder, GeometryError, GeometrySpec};
pub use helper::{DoseTelemetry, DoseTelemetryBuilder};
pub use report::{ReportRecord, ReportSink};
pub use runtime::{DoseGridApp, DoseGridAppBuilder};
pub use scan::{parse_dose_target, ScanDriver, SeedStrategy};
