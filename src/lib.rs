//!
//! # SLM wavefront calibration
//!
//! Measures the phase distortion of a phase-only spatial light modulator (SLM)
//! by two-aperture interferometry.
//! The SLM surface is divided into a grid of square apertures; every aperture of a region of interest
//! is displayed together with a fixed central reference aperture, the resulting fringes are recorded
//! on a camera and fitted with a two-beam interference model.
//! The fitted relative phases and amplitudes are assembled into maps over the region of interest.
//!
//! The measurement elements are created with the builder associated to each element.
//!
//! ```no_run
//! use slm_wavefront::{
//!     devices::{simulated::SimulatedBench, FlatCorrection},
//!     Builder, FromBuilder, WavefrontMeasurement,
//! };
//!
//! let measurement = WavefrontMeasurement::builder()
//!     .n_aperture(8)
//!     .aperture_width(64)
//!     .roi(2, 2, 4)
//!     .build()?;
//! let mut devices = SimulatedBench::builder().build()?.into_devices();
//! let (maps, summary) = measurement.run(&mut devices, &FlatCorrection, &mut ())?;
//! println!("{summary}");
//! println!("{:.3}", maps.phase);
//! # Ok::<(), slm_wavefront::SlmWavefrontError>(())
//! ```

pub mod acquisition;
pub mod aperture;
pub mod devices;
pub mod error;
pub mod fitting;
pub mod mask;
pub mod measurement;
pub mod phase_map;
pub mod utilities;

#[doc(inline)]
pub use self::acquisition::{AcquisitionSequencer, BackgroundMode, Interferogram};
#[doc(inline)]
pub use self::aperture::{Aperture, ApertureError, ApertureGrid, ApertureGridBuilder, RoiWindow};
#[doc(inline)]
pub use self::devices::{Camera, DeviceError, Devices, Frame, Shutter, SpatialLightModulator};
#[doc(inline)]
pub use self::error::SlmWavefrontError;
#[doc(inline)]
pub use self::fitting::{FitConfig, FitResult, SineFit};
#[doc(inline)]
pub use self::mask::{MaskError, MaskLayer, PhaseMask, PhaseMaskComposer};
#[doc(inline)]
pub use self::measurement::{
    CancelToken, MeasurementBuilder, MeasurementError, MeasurementState, RunSummary,
    WavefrontMeasurement,
};
#[doc(inline)]
pub use self::phase_map::{MapSink, PhaseMapError, PickleSink, WavefrontMaps};

pub type Result<T> = std::result::Result<T, SlmWavefrontError>;

/// Builder type trait
pub trait Builder: Default {
    type Component;
    fn new() -> Self {
        Default::default()
    }
    fn build(self) -> Result<Self::Component>;
}

/// Gives access to the builder of a component
pub trait FromBuilder: Sized {
    type ComponentBuilder: Builder<Component = Self>;
    fn builder() -> Self::ComponentBuilder {
        Self::ComponentBuilder::default()
    }
}
