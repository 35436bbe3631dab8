//!
//! # Measurement bench devices
//!
//! The measurement drives three devices: a phase-only [`SpatialLightModulator`], a [`Camera`] in the
//! Fourier plane of the SLM and a [`Shutter`] on the laser beam.
//! The device drivers are implemented outside this crate; [`simulated::SimulatedBench`] is a software bench
//! that renders the fringes of the apertures open on its SLM.

use nalgebra::DMatrix;

use crate::PhaseMask;

pub mod simulated;

/// Averaged camera frame
pub type Frame = DMatrix<f64>;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("SLM failure: {0}")]
    Slm(String),
    #[error("camera failure: {0}")]
    Camera(String),
    #[error("shutter failure: {0}")]
    Shutter(String),
    #[error("cannot load the correction pattern: {0}")]
    Correction(String),
    #[error("camera frame of {found:?} pixels does not match the {expected:?} background")]
    FrameShape {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("invalid device configuration: {0}")]
    Config(String),
}

/// Phase-only spatial light modulator
pub trait SpatialLightModulator {
    /// Returns the (rows,cols) number of pixels
    fn resolution(&self) -> (usize, usize);
    /// Returns the pixel pitch in meters
    fn pitch(&self) -> f64;
    /// Returns the code value of a 2π phase shift at the working wavelength
    fn modulation_depth(&self) -> u8;
    /// Displays a phase pattern
    ///
    /// The codes must be within `0..=modulation_depth`, the call blocks until the pattern is displayed
    fn load_phase(&mut self, codes: &DMatrix<u8>) -> Result<(), DeviceError>;
}

/// Camera
pub trait Camera {
    /// Sets the exposure time in seconds and the number of frames averaged per capture
    fn configure(&mut self, exposure: f64, frame_count: usize) -> Result<(), DeviceError>;
    /// Returns the average of `frame_count` exposures
    fn capture_averaged(&mut self) -> Result<Frame, DeviceError>;
    /// Returns the pixel pitch in meters
    fn pixel_pitch(&self) -> f64;
}

/// Laser beam shutter
pub trait Shutter {
    /// Opens (`true`) or closes (`false`) the shutter
    fn enable(&mut self, open: bool) -> Result<(), DeviceError>;
}

/// Source of the factory correction pattern of the SLM
pub trait CorrectionPatternProvider {
    /// Returns the correction pattern normalized to [0,1] for a SLM of the given (rows,cols) `resolution`
    fn load(&self, resolution: (usize, usize)) -> Result<PhaseMask, DeviceError>;
}

/// No correction
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatCorrection;
impl CorrectionPatternProvider for FlatCorrection {
    fn load(&self, resolution: (usize, usize)) -> Result<PhaseMask, DeviceError> {
        Ok(PhaseMask::zeros(resolution))
    }
}

impl CorrectionPatternProvider for PhaseMask {
    fn load(&self, resolution: (usize, usize)) -> Result<PhaseMask, DeviceError> {
        if self.shape() != resolution {
            return Err(DeviceError::Correction(format!(
                "expected a {resolution:?} pattern, found {:?}",
                self.shape()
            )));
        }
        Ok(self.clone())
    }
}

/// The devices of the measurement bench
pub struct Devices<S, C, H> {
    pub slm: S,
    pub camera: C,
    pub shutter: H,
}
impl<S, C, H> Devices<S, C, H>
where
    S: SpatialLightModulator,
    C: Camera,
    H: Shutter,
{
    pub fn new(slm: S, camera: C, shutter: H) -> Self {
        Self {
            slm,
            camera,
            shutter,
        }
    }
    /// Displays a phase mask on the SLM
    pub fn load_mask(&mut self, mask: &PhaseMask) -> Result<(), DeviceError> {
        let resolution = self.slm.resolution();
        if mask.shape() != resolution {
            return Err(DeviceError::Slm(format!(
                "expected a {resolution:?} phase mask, found {:?}",
                mask.shape()
            )));
        }
        let codes = mask.to_codes(self.slm.modulation_depth());
        self.slm.load_phase(&codes)
    }
}
