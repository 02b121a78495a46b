use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use rand::{rngs::SmallRng, Rng};

use crate::{
    beam::BeamWindow,
    geometry::{DetectorGeometry, Shape},
    materials::MaterialTable,
};

/// Per-run event sampler shared by all workers of the run.
pub trait EventGenerator: Send + Sync {
    /// Simulates one primary and returns the energy deposited in the scoring volumes, MeV.
    fn simulate_event(&self, rng: &mut SmallRng) -> f64;
}

/// The transport collaborator: prepares a generator at the start of each run.
pub trait EventSource: Send + Sync {
    /// Reads whatever run-level inputs the source needs and returns the run's generator.
    fn begin_run(&self) -> Result<Arc<dyn EventGenerator>>;
}

/// Coarse stand-in for the transport toolkit.
///
/// Primaries enter along +z at a point drawn uniformly from the beam window,
/// pass the absorber under them with probability `exp(-μ t)`, and must then
/// cross the detector disc of the same cell. An interaction in the disc
/// deposits a uniform fraction of the primary energy.
pub struct SyntheticBeam {
    geometry: Arc<DetectorGeometry>,
    materials: MaterialTable,
    energy_mev: f64,
    beam_file: PathBuf,
}

impl fmt::Debug for SyntheticBeam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticBeam")
            .field("energy_mev", &self.energy_mev)
            .field("beam_file", &self.beam_file)
            .finish_non_exhaustive()
    }
}

impl SyntheticBeam {
    /// Creates the source; the beam window is re-read from `beam_file` at every run.
    #[must_use]
    pub fn new(
        geometry: Arc<DetectorGeometry>,
        materials: MaterialTable,
        energy_mev: f64,
        beam_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            geometry,
            materials,
            energy_mev,
            beam_file: beam_file.into(),
        }
    }

    fn attenuation(&self, material: &str) -> f64 {
        self.materials
            .find(material)
            .map_or(0.0, |m| m.linear_attenuation_per_cm())
    }

    fn optics(&self) -> Vec<CellOptics> {
        self.geometry
            .absorbers()
            .iter()
            .zip(self.geometry.detectors())
            .map(|(absorber, detector)| {
                let transmission =
                    (-self.attenuation(&absorber.material) * absorber.shape.thickness()).exp();
                let radius = match detector.shape {
                    Shape::Tube { radius, .. } => radius,
                    Shape::Box { half_x, half_y, .. } => half_x.min(half_y),
                };
                let interaction = 1.0
                    - (-self.attenuation(&detector.material) * detector.shape.thickness()).exp();
                CellOptics {
                    transmission,
                    detector_centre: [detector.position[0], detector.position[1]],
                    detector_radius: radius,
                    interaction,
                }
            })
            .collect()
    }
}

impl EventSource for SyntheticBeam {
    fn begin_run(&self) -> Result<Arc<dyn EventGenerator>> {
        let window = BeamWindow::read(&self.beam_file)
            .with_context(|| format!("loading beam window from {}", self.beam_file.display()))?;
        Ok(Arc::new(BeamKernel {
            window,
            geometry: Arc::clone(&self.geometry),
            cells: self.optics(),
            energy_mev: self.energy_mev,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct CellOptics {
    transmission: f64,
    detector_centre: [f64; 2],
    detector_radius: f64,
    interaction: f64,
}

struct BeamKernel {
    window: BeamWindow,
    geometry: Arc<DetectorGeometry>,
    cells: Vec<CellOptics>,
    energy_mev: f64,
}

impl EventGenerator for BeamKernel {
    fn simulate_event(&self, rng: &mut SmallRng) -> f64 {
        let (x, y) = self.window.sample(rng);
        let Some(cell) = self.geometry.cell_at(x, y).and_then(|idx| self.cells.get(idx)) else {
            return 0.0;
        };
        if rng.gen::<f64>() >= cell.transmission {
            return 0.0;
        }
        let dx = x - cell.detector_centre[0];
        let dy = y - cell.detector_centre[1];
        if dx.hypot(dy) > cell.detector_radius {
            return 0.0;
        }
        if rng.gen::<f64>() >= cell.interaction {
            return 0.0;
        }
        self.energy_mev * rng.gen::<f64>()
    }
}

/// Draws deposits uniformly from a fixed list.
#[cfg(test)]
pub(crate) struct ReplaySource {
    pub(crate) deposits: Vec<f64>,
}

#[cfg(test)]
impl EventSource for ReplaySource {
    fn begin_run(&self) -> Result<Arc<dyn EventGenerator>> {
        Ok(Arc::new(ReplayGenerator {
            deposits: self.deposits.clone(),
        }))
    }
}

#[cfg(test)]
struct ReplayGenerator {
    deposits: Vec<f64>,
}

#[cfg(test)]
impl EventGenerator for ReplayGenerator {
    fn simulate_event(&self, rng: &mut SmallRng) -> f64 {
        if self.deposits.is_empty() {
            return 0.0;
        }
        self.deposits[rng.gen_range(0..self.deposits.len())]
    }
}
