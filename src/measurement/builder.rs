use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    AcquisitionSequencer, ApertureGridBuilder, BackgroundMode, Builder, FitConfig, RoiWindow,
};

use super::{MeasurementError, WavefrontMeasurement};

/// [`WavefrontMeasurement`] builder
///
/// Default properties:
///  * aperture grid   : 8x8 apertures of 64px
///  * ROI             : 4x4 apertures from aperture (2,2)
///  * acquisition     : 5ms exposure, 3 frames, 2 retries, background with blank phase
///  * wavelength      : 752nm
///  * focal length    : 0.3m
///  * grating period  : 16px
///  * use correction  : true
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementBuilder {
    pub grid: ApertureGridBuilder,
    pub roi: RoiWindow,
    pub acquisition: AcquisitionSequencer,
    pub wavelength: f64,
    pub focal_length: f64,
    pub grating_period: usize,
    pub use_correction: bool,
    pub fit: FitConfig,
}
impl Default for MeasurementBuilder {
    fn default() -> Self {
        Self {
            grid: Default::default(),
            roi: Default::default(),
            acquisition: Default::default(),
            wavelength: 752e-9,
            focal_length: 0.3,
            grating_period: 16,
            use_correction: true,
            fit: Default::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeasurementBuilderError {
    #[error("cannot open `::slm_wavefront::MeasurementBuilder` toml file: {1}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("cannot create `::slm_wavefront::MeasurementBuilder` toml file: {1}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("cannot read `::slm_wavefront::MeasurementBuilder` toml file: {1}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("cannot write `::slm_wavefront::MeasurementBuilder` toml file: {1}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("cannot deserialize `::slm_wavefront::MeasurementBuilder` from toml")]
    Load(#[from] toml::de::Error),
    #[error("cannot serialize `::slm_wavefront::MeasurementBuilder` into toml")]
    Save(#[from] toml::ser::Error),
}

/// ## `WavefrontMeasurement` builder
impl MeasurementBuilder {
    /// Load the measurement builder from a toml file
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, MeasurementBuilderError> {
        let mut file = File::open(&path)
            .map_err(|e| MeasurementBuilderError::Open(e, path.as_ref().to_path_buf()))?;
        let mut toml = String::new();
        file.read_to_string(&mut toml)
            .map_err(|e| MeasurementBuilderError::Read(e, path.as_ref().to_path_buf()))?;
        let builder: MeasurementBuilder = toml::from_str(&toml)?;
        Ok(builder)
    }
    /// Save the measurement builder into a toml file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), MeasurementBuilderError> {
        let toml = toml::to_string_pretty(self)?;
        let mut file = File::create(&path)
            .map_err(|e| MeasurementBuilderError::Create(e, path.as_ref().to_path_buf()))?;
        write!(file, "# ::slm_wavefront::MeasurementBuilder\n\n{}", toml)
            .map_err(|e| MeasurementBuilderError::Write(e, path.as_ref().to_path_buf()))?;
        Ok(())
    }
    /// Set the number of apertures along one side of the grid
    pub fn n_aperture(self, n_aperture: usize) -> Self {
        Self {
            grid: self.grid.n_aperture(n_aperture),
            ..self
        }
    }
    /// Set the aperture width in SLM pixels
    pub fn aperture_width(self, aperture_width: usize) -> Self {
        Self {
            grid: self.grid.aperture_width(aperture_width),
            ..self
        }
    }
    /// Set the aperture grid
    pub fn grid(self, grid: ApertureGridBuilder) -> Self {
        Self { grid, ..self }
    }
    /// Set the ROI: `size`x`size` apertures from the aperture at (`row`,`col`)
    pub fn roi(self, row: usize, col: usize, size: usize) -> Self {
        Self {
            roi: RoiWindow::new(row, col, size),
            ..self
        }
    }
    /// Set the camera exposure time in seconds
    pub fn exposure(self, exposure: f64) -> Self {
        Self {
            acquisition: AcquisitionSequencer {
                exposure,
                ..self.acquisition
            },
            ..self
        }
    }
    /// Set the number of frames averaged per capture
    pub fn num_frames(self, num_frames: usize) -> Self {
        Self {
            acquisition: AcquisitionSequencer {
                num_frames,
                ..self.acquisition
            },
            ..self
        }
    }
    /// Set the number of times a failed capture is repeated
    pub fn capture_retries(self, capture_retries: usize) -> Self {
        Self {
            acquisition: AcquisitionSequencer {
                capture_retries,
                ..self.acquisition
            },
            ..self
        }
    }
    /// Set how the background is recorded
    pub fn background_mode(self, background_mode: BackgroundMode) -> Self {
        Self {
            acquisition: AcquisitionSequencer {
                background_mode,
                ..self.acquisition
            },
            ..self
        }
    }
    /// Set the laser wavelength in meters
    pub fn wavelength(self, wavelength: f64) -> Self {
        Self { wavelength, ..self }
    }
    /// Set the focal length of the lens between the SLM and the camera in meters
    pub fn focal_length(self, focal_length: f64) -> Self {
        Self {
            focal_length,
            ..self
        }
    }
    /// Set the period in SLM pixels of the grating displayed on the open apertures
    pub fn grating_period(self, grating_period: usize) -> Self {
        Self {
            grating_period,
            ..self
        }
    }
    /// Superpose (`true`) or not (`false`) the correction pattern to the phase masks
    pub fn use_correction(self, use_correction: bool) -> Self {
        Self {
            use_correction,
            ..self
        }
    }
    /// Set the fringe fit configuration
    pub fn fit(self, fit: FitConfig) -> Self {
        Self { fit, ..self }
    }
}

impl Builder for MeasurementBuilder {
    type Component = WavefrontMeasurement;

    fn build(self) -> crate::Result<Self::Component> {
        let grid = self.grid.build()?;
        let roi = grid.select_roi(&self.roi)?;
        let invalid = |msg: String| -> crate::Result<WavefrontMeasurement> {
            Err(MeasurementError::InvalidParameter(msg).into())
        };
        if !(self.wavelength > 0. && self.focal_length > 0.) {
            return invalid(format!(
                "wavelength ({}) and focal length ({}) must be positive",
                self.wavelength, self.focal_length
            ));
        }
        if self.grating_period < 2 {
            return invalid(format!(
                "the grating period must be at least 2px, found {}",
                self.grating_period
            ));
        }
        if self.acquisition.num_frames == 0 || !(self.acquisition.exposure > 0.) {
            return invalid(format!(
                "invalid acquisition: {} frames of {}s",
                self.acquisition.num_frames, self.acquisition.exposure
            ));
        }
        if self.fit.phase_seeds.is_empty() {
            return invalid("at least one initial phase is required for the fit".into());
        }
        log::info!(
            "measurement of {} apertures around aperture #{}",
            roi.len(),
            grid.center_index()
        );
        Ok(WavefrontMeasurement {
            grid,
            roi_window: self.roi,
            roi,
            acquisition: self.acquisition,
            wavelength: self.wavelength,
            focal_length: self.focal_length,
            grating_period: self.grating_period,
            use_correction: self.use_correction,
            fit: self.fit,
        })
    }
}
