use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::lattice_coordinate;

/// Default beam-position file name.
pub const BEAM_FILE: &str = "GunPositionParameters.txt";

/// Problems with the beam-position file.
#[derive(Debug, Error)]
pub enum BeamFileError {
    /// Read or write failure.
    #[error("beam file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Contents are not four floating-point fields.
    #[error("beam file {path}: expected 4 numeric fields, found `{contents}`")]
    Malformed {
        /// File path.
        path: PathBuf,
        /// Raw contents.
        contents: String,
    },
}

/// Transverse region the primaries are fired from, in cm.
///
/// Stored on disk as four tab-separated values: `x_min x_span y_min y_span`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeamWindow {
    /// Lower x bound.
    pub x_min: f64,
    /// Width along x.
    pub x_span: f64,
    /// Lower y bound.
    pub y_min: f64,
    /// Width along y.
    pub y_span: f64,
}

impl Default for BeamWindow {
    fn default() -> Self {
        Self::new(0.0, 100.0, 0.0, 100.0)
    }
}

impl BeamWindow {
    /// Creates a window.
    #[must_use]
    pub const fn new(x_min: f64, x_span: f64, y_min: f64, y_span: f64) -> Self {
        Self {
            x_min,
            x_span,
            y_min,
            y_span,
        }
    }

    /// Unit window at the lower corner of grid cell `(i, j)`, as the scan fires it.
    #[must_use]
    pub fn scan_cell(envelope_xy: f64, grid_size: usize, i: usize, j: usize) -> Self {
        Self::new(
            lattice_coordinate(envelope_xy, grid_size, i),
            1.0,
            lattice_coordinate(envelope_xy, grid_size, j),
            1.0,
        )
    }

    /// Draws an entry point uniformly from the window.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> (f64, f64) {
        (
            rng.gen::<f64>().mul_add(self.x_span, self.x_min),
            rng.gen::<f64>().mul_add(self.y_span, self.y_min),
        )
    }

    /// File representation with six decimals per field.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{:.6}\t{:.6}\t{:.6}\t{:.6}",
            self.x_min, self.x_span, self.y_min, self.y_span
        )
    }

    /// Parses the file representation; any whitespace separates fields.
    pub fn parse(path: &Path, contents: &str) -> Result<Self, BeamFileError> {
        let malformed = || BeamFileError::Malformed {
            path: path.to_path_buf(),
            contents: contents.trim().to_string(),
        };
        let fields = contents
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| malformed())?;
        match fields.as_slice() {
            [x_min, x_span, y_min, y_span] => Ok(Self::new(*x_min, *x_span, *y_min, *y_span)),
            _ => Err(malformed()),
        }
    }

    /// Reads the window from `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, BeamFileError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| BeamFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    /// Overwrites `path` with this window.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), BeamFileError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| BeamFileError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, self.to_line()).map_err(|source| BeamFileError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
