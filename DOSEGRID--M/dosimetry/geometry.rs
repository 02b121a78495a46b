use std::{f64::consts::PI, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::materials::{Material, MaterialTable};

/// Errors raised while building the grid. All of them are fatal at startup.
#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    /// Grid must have at least one cell per side.
    #[error("grid size must be positive, got {0}")]
    InvalidGridSize(usize),
    /// A length parameter was zero, negative or not finite.
    #[error("{name} must be a positive length, got {value}")]
    NonPositiveDimension {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },
    /// Material name is not in the table.
    #[error("unknown material `{0}`")]
    UnknownMaterial(String),
    /// Placements would overlap or leave the envelope.
    #[error("overlapping placement: {0}")]
    Overlap(String),
}

/// Solid shape with dimensions in cm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// Axis-aligned box given by half-extents.
    Box {
        /// Half-extent along x.
        half_x: f64,
        /// Half-extent along y.
        half_y: f64,
        /// Half-extent along z.
        half_z: f64,
    },
    /// Full cylinder along z.
    Tube {
        /// Outer radius.
        radius: f64,
        /// Half-length along z.
        half_z: f64,
    },
}

impl Shape {
    /// Geometric volume in cm³.
    #[must_use]
    pub fn cubic_cm(&self) -> f64 {
        match *self {
            Self::Box {
                half_x,
                half_y,
                half_z,
            } => 8.0 * half_x * half_y * half_z,
            Self::Tube { radius, half_z } => PI * radius * radius * 2.0 * half_z,
        }
    }

    /// Full thickness along z in cm.
    #[must_use]
    pub fn thickness(&self) -> f64 {
        match *self {
            Self::Box { half_z, .. } | Self::Tube { half_z, .. } => 2.0 * half_z,
        }
    }
}

/// A placed region of the detector. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Unique name, e.g. `Box_1_2`.
    pub name: String,
    /// Solid.
    pub shape: Shape,
    /// Material name.
    pub material: String,
    /// Centre of the placement in cm.
    pub position: [f64; 3],
    /// Grid coordinates `(i, j)`; `None` for world and envelope.
    pub grid: Option<(usize, usize)>,
    /// Mass in kg.
    pub mass_kg: f64,
}

impl Volume {
    fn place(
        name: String,
        shape: Shape,
        material: &Material,
        position: [f64; 3],
        grid: Option<(usize, usize)>,
    ) -> Self {
        let mass_kg = material.density_g_cm3 * shape.cubic_cm() / 1000.0;
        Self {
            name,
            shape,
            material: material.name.clone(),
            position,
            grid,
            mass_kg,
        }
    }
}

/// Construction parameters for the absorber/detector grid. Lengths in cm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometrySpec {
    /// Cells per side.
    pub grid_size: usize,
    /// Transverse size of the envelope.
    pub envelope_xy: f64,
    /// Depth of the envelope.
    pub envelope_z: f64,
    /// Envelope material.
    pub environment_material: String,
    /// World material; the world is 1.2 times the envelope.
    pub world_material: String,
    /// Transverse size of each absorber.
    pub absorber_xy: f64,
    /// Thickness of absorber 0; each later cell adds `absorber_thickness_step`.
    pub absorber_base_thickness: f64,
    /// Thickness increment per flat cell index.
    pub absorber_thickness_step: f64,
    /// Absorber material.
    pub array_material: String,
    /// z of the absorber centres.
    pub absorber_z: f64,
    /// Detector disc radius.
    pub detector_radius: f64,
    /// Detector disc thickness.
    pub detector_thickness: f64,
    /// Detector material.
    pub detector_material: String,
    /// z of the detector centres.
    pub detector_z: f64,
}

impl Default for GeometrySpec {
    fn default() -> Self {
        Self {
            grid_size: 4,
            envelope_xy: 100.0,
            envelope_z: 100.0,
            environment_material: "G4_AIR".into(),
            world_material: "G4_AIR".into(),
            absorber_xy: 16.0,
            absorber_base_thickness: 0.1,
            absorber_thickness_step: 0.1,
            array_material: "G4_Pb".into(),
            absorber_z: 7.0,
            detector_radius: 2.5,
            detector_thickness: 0.1,
            detector_material: "G4_Pb".into(),
            detector_z: 17.0,
        }
    }
}

impl GeometrySpec {
    /// Lattice pitch between neighbouring cells.
    #[must_use]
    pub fn pitch(&self) -> f64 {
        lattice_pitch(self.envelope_xy, self.grid_size)
    }

    /// Thickness of the absorber in flat cell `index`.
    #[must_use]
    pub fn absorber_thickness(&self, index: usize) -> f64 {
        self.absorber_base_thickness + index as f64 * self.absorber_thickness_step
    }

    /// Checks lengths and that every placement fits without overlap.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.grid_size == 0 {
            return Err(GeometryError::InvalidGridSize(self.grid_size));
        }
        let lengths = [
            ("envelope_xy", self.envelope_xy),
            ("envelope_z", self.envelope_z),
            ("absorber_xy", self.absorber_xy),
            ("absorber_base_thickness", self.absorber_base_thickness),
            ("detector_radius", self.detector_radius),
            ("detector_thickness", self.detector_thickness),
        ];
        for (name, value) in lengths {
            if !(value.is_finite() && value > 0.0) {
                return Err(GeometryError::NonPositiveDimension { name, value });
            }
        }
        if self.absorber_thickness_step < 0.0 {
            return Err(GeometryError::NonPositiveDimension {
                name: "absorber_thickness_step",
                value: self.absorber_thickness_step,
            });
        }
        if self.grid_size > 1 && self.absorber_xy >= self.pitch() {
            return Err(GeometryError::Overlap(format!(
                "absorber size {} cm does not fit lattice pitch {} cm",
                self.absorber_xy,
                self.pitch()
            )));
        }
        if self.detector_radius > 0.5 * self.absorber_xy {
            return Err(GeometryError::Overlap(format!(
                "detector radius {} cm exceeds absorber half-size {} cm",
                self.detector_radius,
                0.5 * self.absorber_xy
            )));
        }
        let half_env = 0.5 * self.envelope_xy;
        let last = lattice_coordinate(self.envelope_xy, self.grid_size, self.grid_size - 1);
        let first = lattice_coordinate(self.envelope_xy, self.grid_size, 0);
        let reach = 0.5 * self.absorber_xy;
        if first - reach < -half_env || last + reach > half_env {
            return Err(GeometryError::Overlap(
                "outer cells extend past the envelope".into(),
            ));
        }
        let thickest = self.absorber_thickness(self.grid_size * self.grid_size - 1);
        let absorber_back = self.absorber_z + 0.5 * thickest;
        let detector_front = self.detector_z - 0.5 * self.detector_thickness;
        if absorber_back > detector_front {
            return Err(GeometryError::Overlap(format!(
                "thickest absorber ends at z={absorber_back} cm, past the detectors at z={detector_front} cm"
            )));
        }
        if detector_front + self.detector_thickness > 0.5 * self.envelope_z {
            return Err(GeometryError::Overlap(
                "detectors extend past the envelope".into(),
            ));
        }
        Ok(())
    }
}

/// Distance between neighbouring cell centres.
#[must_use]
pub fn lattice_pitch(envelope_xy: f64, grid_size: usize) -> f64 {
    envelope_xy / grid_size.max(1) as f64
}

/// Transverse coordinate of cell `k` along either axis, starting at 40% of the envelope below zero.
#[must_use]
pub fn lattice_coordinate(envelope_xy: f64, grid_size: usize, k: usize) -> f64 {
    k as f64 * lattice_pitch(envelope_xy, grid_size) - 0.4 * envelope_xy
}

/// Built detector: world, envelope and the index-aligned absorber/detector lists.
#[derive(Debug, Clone)]
pub struct DetectorGeometry {
    grid_size: usize,
    world: Volume,
    envelope: Volume,
    absorbers: Vec<Arc<Volume>>,
    detectors: Vec<Arc<Volume>>,
}

impl DetectorGeometry {
    /// Cells per side.
    #[must_use]
    pub const fn grid_size(&self) -> usize {
        self.grid_size
    }

    /// World volume.
    #[must_use]
    pub const fn world(&self) -> &Volume {
        &self.world
    }

    /// Envelope volume.
    #[must_use]
    pub const fn envelope(&self) -> &Volume {
        &self.envelope
    }

    /// Absorbers indexed by `i * N + j`.
    #[must_use]
    pub fn absorbers(&self) -> &[Arc<Volume>] {
        &self.absorbers
    }

    /// Scoring detectors indexed by `i * N + j`.
    #[must_use]
    pub fn detectors(&self) -> &[Arc<Volume>] {
        &self.detectors
    }

    /// Number of scoring volumes.
    #[must_use]
    pub fn volume_count(&self) -> usize {
        self.detectors.len()
    }

    /// Flat index of grid cell `(i, j)`.
    #[must_use]
    pub fn cell_index(&self, i: usize, j: usize) -> Option<usize> {
        (i < self.grid_size && j < self.grid_size).then(|| i * self.grid_size + j)
    }

    /// Mass in kg of the named volume.
    #[must_use]
    pub fn mass_of(&self, name: &str) -> Option<f64> {
        self.absorbers
            .iter()
            .chain(self.detectors.iter())
            .map(|volume| &**volume)
            .chain([&self.world, &self.envelope])
            .find(|volume| volume.name == name)
            .map(|volume| volume.mass_kg)
    }

    /// Flat index of the absorber covering transverse point `(x, y)`.
    #[must_use]
    pub fn cell_at(&self, x: f64, y: f64) -> Option<usize> {
        self.absorbers.iter().position(|volume| match volume.shape {
            Shape::Box { half_x, half_y, .. } => {
                (x - volume.position[0]).abs() <= half_x && (y - volume.position[1]).abs() <= half_y
            }
            Shape::Tube { .. } => false,
        })
    }
}

/// Builds the grid once; consuming `build` makes a second registration impossible.
#[derive(Debug, Clone)]
pub struct GeometryBuilder {
    spec: GeometrySpec,
    materials: MaterialTable,
}

impl GeometryBuilder {
    /// Creates a builder.
    #[must_use]
    pub const fn new(spec: GeometrySpec, materials: MaterialTable) -> Self {
        Self { spec, materials }
    }

    fn material(&self, name: &str) -> Result<&Material, GeometryError> {
        self.materials
            .find(name)
            .ok_or_else(|| GeometryError::UnknownMaterial(name.to_string()))
    }

    /// Validates the parameters and places every volume.
    pub fn build(self) -> Result<DetectorGeometry, GeometryError> {
        let spec = &self.spec;
        spec.validate()?;
        let world_material = self.material(&spec.world_material)?;
        let env_material = self.material(&spec.environment_material)?;
        let absorber_material = self.material(&spec.array_material)?;
        let detector_material = self.material(&spec.detector_material)?;

        let world = Volume::place(
            "World".into(),
            Shape::Box {
                half_x: 0.6 * spec.envelope_xy,
                half_y: 0.6 * spec.envelope_xy,
                half_z: 0.6 * spec.envelope_z,
            },
            world_material,
            [0.0; 3],
            None,
        );
        let envelope = Volume::place(
            "Envelope".into(),
            Shape::Box {
                half_x: 0.5 * spec.envelope_xy,
                half_y: 0.5 * spec.envelope_xy,
                half_z: 0.5 * spec.envelope_z,
            },
            env_material,
            [0.0; 3],
            None,
        );

        let n = spec.grid_size;
        let mut absorbers = Vec::with_capacity(n * n);
        let mut detectors = Vec::with_capacity(n * n);
        for i in 0..n {
            let x = lattice_coordinate(spec.envelope_xy, n, i);
            for j in 0..n {
                let y = lattice_coordinate(spec.envelope_xy, n, j);
                let index = i * n + j;
                absorbers.push(Arc::new(Volume::place(
                    format!("Box_{i}_{j}"),
                    Shape::Box {
                        half_x: 0.5 * spec.absorber_xy,
                        half_y: 0.5 * spec.absorber_xy,
                        half_z: 0.5 * spec.absorber_thickness(index),
                    },
                    absorber_material,
                    [x, y, spec.absorber_z],
                    Some((i, j)),
                )));
                detectors.push(Arc::new(Volume::place(
                    format!("Tube_{i}_{j}"),
                    Shape::Tube {
                        radius: spec.detector_radius,
                        half_z: 0.5 * spec.detector_thickness,
                    },
                    detector_material,
                    [x, y, spec.detector_z],
                    Some((i, j)),
                )));
            }
        }

        Ok(DetectorGeometry {
            grid_size: n,
            world,
            envelope,
            absorbers,
            detectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_default() -> DetectorGeometry {
        GeometryBuilder::new(GeometrySpec::default(), MaterialTable::nist())
            .build()
            .unwrap()
    }

    #[test]
    fn builds_index_aligned_grid() {
        let geometry = build_default();
        assert_eq!(geometry.absorbers().len(), 16);
        assert_eq!(geometry.detectors().len(), 16);
        let index = geometry.cell_index(1, 2).unwrap();
        assert_eq!(index, 6);
        assert_eq!(geometry.absorbers()[index].name, "Box_1_2");
        assert_eq!(geometry.detectors()[index].name, "Tube_1_2");
        assert_eq!(geometry.absorbers()[index].position, [-15.0, 10.0, 7.0]);
        assert_eq!(geometry.detectors()[index].position, [-15.0, 10.0, 17.0]);
        assert!(geometry.cell_index(4, 0).is_none());
    }

    #[test]
    fn absorber_thickness_grows_per_cell() {
        let geometry = build_default();
        let first = geometry.absorbers()[0].shape.thickness();
        let last = geometry.absorbers()[15].shape.thickness();
        assert!((first - 0.1).abs() < 1e-12);
        assert!((last - 1.6).abs() < 1e-12);
    }

    #[test]
    fn masses_follow_density_and_volume() {
        let geometry = build_default();
        let box_mass = geometry.mass_of("Box_0_0").unwrap();
        assert!((box_mass - 0.290_56).abs() < 1e-9);
        let tube_mass = geometry.mass_of("Tube_3_3").unwrap();
        let expected = 11.35 * PI * 2.5 * 2.5 * 0.1 / 1000.0;
        assert!((tube_mass - expected).abs() < 1e-12);
        assert!(geometry.mass_of("Box_9_9").is_none());
    }

    #[test]
    fn locates_cells_by_transverse_point() {
        let geometry = build_default();
        assert_eq!(geometry.cell_at(-40.0, -40.0), Some(0));
        assert_eq!(geometry.cell_at(35.5, 10.0), Some(14));
        assert_eq!(geometry.cell_at(-27.0, 0.0), None);
    }

    #[test]
    fn rejects_empty_grid() {
        let spec = GeometrySpec {
            grid_size: 0,
            ..GeometrySpec::default()
        };
        let err = GeometryBuilder::new(spec, MaterialTable::nist())
            .build()
            .unwrap_err();
        assert_eq!(err, GeometryError::InvalidGridSize(0));
    }

    #[test]
    fn rejects_overlapping_absorbers() {
        let spec = GeometrySpec {
            absorber_xy: 30.0,
            ..GeometrySpec::default()
        };
        let err = GeometryBuilder::new(spec, MaterialTable::nist())
            .build()
            .unwrap_err();
        assert!(matches!(err, GeometryError::Overlap(_)));
    }

    #[test]
    fn rejects_unknown_material() {
        let spec = GeometrySpec {
            array_material: "Kryptonite".into(),
            ..GeometrySpec::default()
        };
        let err = GeometryBuilder::new(spec, MaterialTable::nist())
            .build()
            .unwrap_err();
        assert_eq!(err, GeometryError::UnknownMaterial("Kryptonite".into()));
    }
}
