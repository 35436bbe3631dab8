//!
//! # Wavefront maps
//!
//! The fit results of the apertures of the region of interest are reshaped, in row-major order,
//! into square maps of the SLM phase, of the amplitude and of the phase error.
//! The phase of an aperture is the opposite of the fitted phase: it is the phase that must be
//! added to the aperture to bring it in phase with the reference aperture.

use std::{
    f64::consts::PI,
    fs::File,
    path::{Path, PathBuf},
};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::{utilities::wrap, ApertureError, ApertureGrid, FitResult, PhaseMask, RoiWindow};

#[derive(Debug, thiserror::Error)]
pub enum PhaseMapError {
    #[error("expected {expected} fit results, found {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("the {size}x{size} maps do not match the {roi_size}x{roi_size} ROI")]
    RoiMismatch { size: usize, roi_size: usize },
    #[error("the aperture grid region {region:?} is outside the {resolution:?} SLM")]
    Footprint {
        region: (usize, usize, usize, usize),
        resolution: (usize, usize),
    },
    #[error("invalid ROI")]
    Aperture(#[from] ApertureError),
    #[error("cannot create wavefront maps file: {1}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("cannot open wavefront maps file: {1}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("wavefront maps pickling failed")]
    Pickle(#[from] serde_pickle::Error),
}

/// Phase, amplitude and phase error maps over the region of interest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavefrontMaps {
    /// Phase in radians relative to the reference aperture
    pub phase: DMatrix<f64>,
    /// Product of the field amplitudes of the aperture and of the reference aperture
    pub amplitude: DMatrix<f64>,
    /// Standard deviation of the phase in radians
    pub phase_error: DMatrix<f64>,
    /// Fit convergence
    pub converged: DMatrix<bool>,
}
impl WavefrontMaps {
    /// Reshapes the fit results of a `roi_size`x`roi_size` ROI into maps
    pub fn assemble(fit_results: &[FitResult], roi_size: usize) -> Result<Self, PhaseMapError> {
        let expected = roi_size * roi_size;
        if fit_results.len() != expected {
            return Err(PhaseMapError::ShapeMismatch {
                expected,
                found: fit_results.len(),
            });
        }
        let map = |f: fn(&FitResult) -> f64| {
            DMatrix::from_row_iterator(roi_size, roi_size, fit_results.iter().map(f))
        };
        Ok(Self {
            phase: map(|r| -r.phi),
            amplitude: map(FitResult::amplitude),
            phase_error: map(FitResult::phase_error),
            converged: DMatrix::from_row_iterator(
                roi_size,
                roi_size,
                fit_results.iter().map(|r| r.converged),
            ),
        })
    }
    /// Returns the size of the square maps
    pub fn size(&self) -> usize {
        self.phase.nrows()
    }
    /// Returns the number of apertures which fit did not converge
    pub fn n_failed(&self) -> usize {
        self.converged.iter().filter(|c| !**c).count()
    }
    /// Converts the phase map into a correction pattern for a SLM of (rows,cols) `resolution`
    ///
    /// The normalized phase is painted on the footprint of each aperture of the ROI and is zero elsewhere
    pub fn correction_pattern(
        &self,
        grid: &ApertureGrid,
        roi: &RoiWindow,
        resolution: (usize, usize),
    ) -> Result<PhaseMask, PhaseMapError> {
        if roi.size != self.size() {
            return Err(PhaseMapError::RoiMismatch {
                size: self.size(),
                roi_size: roi.size,
            });
        }
        let region = grid.region();
        if region.1 > resolution.0 || region.3 > resolution.1 {
            return Err(PhaseMapError::Footprint { region, resolution });
        }
        let mut pattern = DMatrix::<f64>::zeros(resolution.0, resolution.1);
        let phase = self.phase.transpose();
        for (&index, &phi) in grid.select_roi(roi)?.iter().zip(phase.iter()) {
            let aperture = grid.get(index)?;
            pattern
                .view_mut(
                    (aperture.top, aperture.left),
                    (aperture.height(), aperture.width()),
                )
                .fill(wrap(phi / (2. * PI)));
        }
        Ok(pattern.into())
    }
    /// Writes the maps into a pickle file
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<(), PhaseMapError> {
        let mut file = File::create(&path)
            .map_err(|e| PhaseMapError::Create(e, path.as_ref().to_path_buf()))?;
        serde_pickle::to_writer(&mut file, self, Default::default())?;
        log::info!("wavefront maps saved to {}", path.as_ref().display());
        Ok(())
    }
    /// Reads the maps from a pickle file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PhaseMapError> {
        let file =
            File::open(&path).map_err(|e| PhaseMapError::Open(e, path.as_ref().to_path_buf()))?;
        Ok(serde_pickle::from_reader(file, Default::default())?)
    }
}

/// Receiver of the maps of a measurement
pub trait MapSink {
    fn store(&mut self, maps: &WavefrontMaps) -> Result<(), PhaseMapError>;
}
/// Discards the maps
impl MapSink for () {
    fn store(&mut self, _maps: &WavefrontMaps) -> Result<(), PhaseMapError> {
        Ok(())
    }
}

/// Pickle file storage of the maps
#[derive(Debug, Clone)]
pub struct PickleSink {
    path: PathBuf,
}
impl PickleSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}
impl MapSink for PickleSink {
    fn store(&mut self, maps: &WavefrontMaps) -> Result<(), PhaseMapError> {
        maps.dump(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Matrix3;

    use super::*;
    use crate::{Builder, FromBuilder};

    fn result(phi: f64, a1: f64, a2: f64, var: f64) -> FitResult {
        FitResult {
            phi,
            a1,
            a2,
            covariance: Matrix3::from_diagonal_element(var),
            converged: true,
            chi2: 1.,
            n_evaluations: 10,
        }
    }

    #[test]
    fn row_major_maps() {
        let mut results: Vec<_> = (0..4)
            .map(|i| result(0.1 * i as f64, 2., -1.5, 0.04))
            .collect();
        results[3] = FitResult::failed(100);
        let maps = WavefrontMaps::assemble(&results, 2).unwrap();
        assert_eq!(maps.size(), 2);
        assert_eq!(maps.phase[(0, 1)], -0.1);
        assert_eq!(maps.phase[(1, 0)], -0.2);
        assert_eq!(maps.phase[(1, 1)], 0.);
        assert_eq!(maps.amplitude[(0, 0)], 3.);
        assert_eq!(maps.amplitude[(1, 1)], 0.);
        assert!((maps.phase_error[(1, 0)] - 0.2).abs() < 1e-12);
        assert!(!maps.converged[(1, 1)]);
        assert_eq!(maps.n_failed(), 1);
    }

    #[test]
    fn shape_mismatch() {
        let results = vec![FitResult::failed(0); 5];
        assert!(matches!(
            WavefrontMaps::assemble(&results, 2),
            Err(PhaseMapError::ShapeMismatch {
                expected: 4,
                found: 5
            })
        ));
    }

    #[test]
    fn correction_pattern() {
        let grid = ApertureGrid::builder()
            .n_aperture(4)
            .aperture_width(8)
            .extent(32, 40)
            .build()
            .unwrap();
        let results = vec![
            result(-PI / 2., 1., 1., 0.),
            result(0., 1., 1., 0.),
            result(PI / 2., 1., 1., 0.),
            result(PI, 1., 1., 0.),
        ];
        let maps = WavefrontMaps::assemble(&results, 2).unwrap();
        let roi = RoiWindow::new(1, 2, 2);
        let pattern = maps.correction_pattern(&grid, &roi, (32, 40)).unwrap();
        assert_eq!(pattern.shape(), (32, 40));
        // aperture #6 at rows 8..16, cols 16..24
        assert!(pattern.footprint(grid.get(6).unwrap()).iter().all(|&p| p == 0.25));
        assert!(pattern.footprint(grid.get(7).unwrap()).iter().all(|&p| p == 0.));
        assert!(pattern.footprint(grid.get(10).unwrap()).iter().all(|&p| p == 0.75));
        assert!(pattern.footprint(grid.get(11).unwrap()).iter().all(|&p| p == 0.5));
        assert_eq!(pattern[(0, 0)], 0.);
        assert_eq!(pattern[(20, 35)], 0.);
        assert!(matches!(
            maps.correction_pattern(&grid, &RoiWindow::new(0, 0, 3), (32, 40)),
            Err(PhaseMapError::RoiMismatch { .. })
        ));
        assert!(matches!(
            maps.correction_pattern(&grid, &RoiWindow::new(3, 3, 2), (32, 40)),
            Err(PhaseMapError::Aperture(_))
        ));
        assert!(matches!(
            maps.correction_pattern(&grid, &roi, (32, 24)),
            Err(PhaseMapError::Footprint { .. })
        ));
    }

    #[test]
    fn pickle_file() -> anyhow::Result<()> {
        let results: Vec<_> = (0..9)
            .map(|i| result(0.3 * i as f64 - 1., 1., 2., 1e-4))
            .collect();
        let maps = WavefrontMaps::assemble(&results, 3)?;
        let path = std::env::temp_dir().join(format!("wavefront-maps-{}.pkl", std::process::id()));
        let mut sink = PickleSink::new(&path);
        sink.store(&maps)?;
        let loaded = WavefrontMaps::load(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(loaded, maps);
        Ok(())
    }
}
