use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer, Serialize};
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{beam::BEAM_FILE, geometry::GeometryError, geometry::GeometrySpec};

/// Environment variable naming the TOML configuration file.
pub const CONFIG_ENV: &str = "DOSEGRID_CONFIG";

/// Configuration problems; all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("reading config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Configuration file is not valid TOML for this schema.
    #[error("parsing config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// Environment override could not be parsed.
    #[error("environment override {variable}=`{value}` is not a number")]
    Override {
        /// Variable name.
        variable: &'static str,
        /// Raw value.
        value: String,
    },
    /// A field holds an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong.
        reason: String,
    },
    /// Geometry parameters are inconsistent.
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// Full application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoseGridConfig {
    /// Grid construction.
    pub geometry: GeometrySpec,
    /// Primary particle and beam file.
    pub beam: BeamConfig,
    /// Engine settings.
    pub run: RunConfig,
    /// Output files and diagnostics.
    pub output: OutputConfig,
}

/// `[beam]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    /// Particle name used in the run condition.
    pub particle: String,
    /// Primary energy in MeV.
    pub energy_mev: f64,
    /// Beam-position file; relative paths resolve against the output directory.
    pub position_file: PathBuf,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            particle: "gamma".into(),
            energy_mev: 6.0,
            position_file: PathBuf::from(BEAM_FILE),
        }
    }
}

/// `[run]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Worker threads per run.
    pub threads: usize,
    /// Initial master seed; random when absent.
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            seed: None,
        }
    }
}

/// `[output]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving the report files.
    pub directory: PathBuf,
    /// JSON-lines diagnostic log; stderr when absent.
    pub log_path: Option<PathBuf>,
    /// Minimum diagnostic level.
    #[serde(deserialize_with = "level_from_str")]
    pub log_level: LogLevel,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            log_path: None,
            log_level: LogLevel::Info,
        }
    }
}

fn level_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LogLevel, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl DoseGridConfig {
    /// Loads a TOML file; missing sections and keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolves the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    /// Loads the file named by [`CONFIG_ENV`] (or defaults), applies overrides and validates.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_ENV).filter(|path| !path.trim().is_empty()) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the parameter-sweep variables: material names, `detector_size` (cm) and
    /// `particle_energy` (MeV).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let materials = [
            ("environment_material", &mut self.geometry.environment_material),
            ("world_material", &mut self.geometry.world_material),
            ("array_material", &mut self.geometry.array_material),
            ("detector_material", &mut self.geometry.detector_material),
        ];
        for (variable, slot) in materials {
            if let Some(value) = lookup(variable) {
                *slot = value.trim().to_string();
            }
        }
        if let Some(radius) = numeric_override(&lookup, "detector_size")? {
            self.geometry.detector_radius = radius;
        }
        if let Some(energy) = numeric_override(&lookup, "particle_energy")? {
            self.beam.energy_mev = energy;
        }
        Ok(())
    }

    /// Checks fields the geometry builder does not cover, then the geometry itself.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.beam.particle.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "beam.particle",
                reason: "must not be empty".into(),
            });
        }
        if !(self.beam.energy_mev.is_finite() && self.beam.energy_mev > 0.0) {
            return Err(ConfigError::Invalid {
                field: "beam.energy_mev",
                reason: format!("must be a positive energy, got {}", self.beam.energy_mev),
            });
        }
        if self.run.threads == 0 {
            return Err(ConfigError::Invalid {
                field: "run.threads",
                reason: "at least one worker is required".into(),
            });
        }
        self.geometry.validate()?;
        Ok(())
    }

    /// Beam-position file with relative paths resolved against the output directory.
    #[must_use]
    pub fn beam_file(&self) -> PathBuf {
        if self.beam.position_file.is_absolute() {
            self.beam.position_file.clone()
        } else {
            self.output.directory.join(&self.beam.position_file)
        }
    }
}

fn numeric_override(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<f64>, ConfigError> {
    lookup(variable)
        .map(|value| {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::Override { variable, value })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = DoseGridConfig::resolve(env(&[])).unwrap();
        assert_eq!(config.geometry.grid_size, 4);
        assert_eq!(config.beam.particle, "gamma");
        assert!((config.beam.energy_mev - 6.0).abs() < f64::EPSILON);
        assert_eq!(config.beam_file(), Path::new(".").join(BEAM_FILE));
    }

    #[test]
    fn loads_partial_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dosegrid.toml");
        fs::write(
            &path,
            "[geometry]\narray_material = \"G4_W\"\n\n[run]\nthreads = 4\nseed = 9\n\n[output]\ndirectory = \"out\"\nlog_level = \"debug\"\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().into_owned();
        let config = DoseGridConfig::resolve(env(&[(CONFIG_ENV, path_str.as_str())])).unwrap();
        assert_eq!(config.geometry.array_material, "G4_W");
        assert!((config.geometry.envelope_xy - 100.0).abs() < f64::EPSILON);
        assert_eq!(config.run.threads, 4);
        assert_eq!(config.run.seed, Some(9));
        assert_eq!(config.output.log_level, LogLevel::Debug);
        assert_eq!(config.beam_file(), Path::new("out").join(BEAM_FILE));
    }

    #[test]
    fn environment_overrides_apply() {
        let config = DoseGridConfig::resolve(env(&[
            ("array_material", "G4_Cu"),
            ("detector_material", "G4_Si"),
            ("detector_size", "3.5"),
            ("particle_energy", "1.25"),
        ]))
        .unwrap();
        assert_eq!(config.geometry.array_material, "G4_Cu");
        assert_eq!(config.geometry.detector_material, "G4_Si");
        assert!((config.geometry.detector_radius - 3.5).abs() < f64::EPSILON);
        assert!((config.beam.energy_mev - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            DoseGridConfig::resolve(env(&[("particle_energy", "lots")])),
            Err(ConfigError::Override { variable: "particle_energy", .. })
        ));
        assert!(matches!(
            DoseGridConfig::resolve(env(&[("particle_energy", "-1")])),
            Err(ConfigError::Invalid { field: "beam.energy_mev", .. })
        ));
        assert!(matches!(
            DoseGridConfig::resolve(env(&[("detector_size", "20")])),
            Err(ConfigError::Geometry(GeometryError::Overlap(_)))
        ));
        assert!(matches!(
            DoseGridConfig::resolve(env(&[(CONFIG_ENV, "/nonexistent/dosegrid.toml")])),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[run]\nthreads = \"many\"\n").unwrap();
        assert!(matches!(
            DoseGridConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
