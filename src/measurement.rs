//!
//! # Wavefront measurement
//!
//! A [`WavefrontMeasurement`] runs the complete calibration sequence:
//!  1. the phase masks are planned from the aperture grid and the correction pattern,
//!  2. the camera background is recorded,
//!  3. the interferogram of every aperture of the ROI with the reference aperture is recorded,
//!  4. the interferograms are fitted in parallel,
//!  5. the fit results are assembled into [`WavefrontMaps`] that are handed to a [`MapSink`].
//!
//! The grid and the ROI are validated when the measurement is built, before any device is accessed.
//! If the measurement is cancelled or a device fails after the masks are planned, the block mask
//! is loaded on the SLM before the error is returned.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

use crate::{
    acquisition::progress_bar,
    devices::CorrectionPatternProvider,
    phase_map::MapSink,
    AcquisitionSequencer, ApertureGrid, Camera, Devices, FitConfig, FromBuilder, PhaseMask,
    PhaseMaskComposer, RoiWindow, Shutter, SineFit, SpatialLightModulator, WavefrontMaps,
};

mod builder;
pub use builder::{MeasurementBuilder, MeasurementBuilderError};

#[derive(Debug, thiserror::Error)]
pub enum MeasurementError {
    #[error("measurement cancelled after {completed} of {total} apertures")]
    Cancelled { completed: usize, total: usize },
    #[error("invalid measurement parameter: {0}")]
    InvalidParameter(String),
}

/// Progress of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementState {
    Idle,
    GridPlanned,
    BackgroundCaptured,
    /// Recording the interferograms of the ROI, starting with the given aperture
    Looping(usize),
    Fitted,
    Assembled,
    Done,
}

/// Cancellation request shared with a running measurement
///
/// The request is honored between two apertures
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Default::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Measurement summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Number of apertures in the ROI
    pub n_aperture: usize,
    /// Number of interferograms that could not be captured
    pub degraded_captures: usize,
    /// Number of fits that did not converge
    pub failed_fits: usize,
    pub state: MeasurementState,
}
impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} apertures measured ({:?}): {} degraded capture(s), {} failed fit(s)",
            self.n_aperture, self.state, self.degraded_captures, self.failed_fits
        )
    }
}

/// Interferometric SLM wavefront measurement
#[derive(Debug, Clone)]
pub struct WavefrontMeasurement {
    grid: ApertureGrid,
    roi_window: RoiWindow,
    roi: Vec<usize>,
    acquisition: AcquisitionSequencer,
    wavelength: f64,
    focal_length: f64,
    grating_period: usize,
    use_correction: bool,
    fit: FitConfig,
}
impl FromBuilder for WavefrontMeasurement {
    type ComponentBuilder = MeasurementBuilder;
}

fn advance(state: &mut MeasurementState, next: MeasurementState) {
    log::info!("measurement: {state:?} -> {next:?}");
    *state = next;
}

impl WavefrontMeasurement {
    pub fn grid(&self) -> &ApertureGrid {
        &self.grid
    }
    pub fn roi_window(&self) -> &RoiWindow {
        &self.roi_window
    }
    /// Returns the indices of the apertures of the ROI in row-major order
    pub fn roi(&self) -> &[usize] {
        &self.roi
    }
    pub fn acquisition(&self) -> &AcquisitionSequencer {
        &self.acquisition
    }
    /// Builds the mask composer for a SLM of (rows,cols) `resolution`
    ///
    /// The baseline pattern is the grating, with the correction pattern on top of it if
    /// `use_correction` is set, and the block pattern is either the correction pattern or flat
    pub fn composer<P: CorrectionPatternProvider>(
        &self,
        correction: &P,
        resolution: (usize, usize),
    ) -> crate::Result<PhaseMaskComposer> {
        let grating = PhaseMask::grating(resolution, self.grating_period);
        let composer = if self.use_correction {
            let correction = correction.load(resolution)?;
            let baseline = grating.superpose(&correction)?;
            PhaseMaskComposer::new(baseline, correction, self.grid.clone())?
        } else {
            PhaseMaskComposer::with_flat_block(grating, self.grid.clone())?
        };
        Ok(composer)
    }
    /// Runs the measurement
    ///
    /// Returns the wavefront maps, that are also handed to the `sink`, and a summary of the run
    pub fn run<S, C, H, P, K>(
        &self,
        devices: &mut Devices<S, C, H>,
        correction: &P,
        sink: &mut K,
    ) -> crate::Result<(WavefrontMaps, RunSummary)>
    where
        S: SpatialLightModulator,
        C: Camera,
        H: Shutter,
        P: CorrectionPatternProvider,
        K: MapSink,
    {
        self.run_with_cancel(devices, correction, sink, &CancelToken::default())
    }
    /// Runs the measurement until it completes or `cancel` is set
    pub fn run_with_cancel<S, C, H, P, K>(
        &self,
        devices: &mut Devices<S, C, H>,
        correction: &P,
        sink: &mut K,
        cancel: &CancelToken,
    ) -> crate::Result<(WavefrontMaps, RunSummary)>
    where
        S: SpatialLightModulator,
        C: Camera,
        H: Shutter,
        P: CorrectionPatternProvider,
        K: MapSink,
    {
        let mut state = MeasurementState::Idle;
        let composer = self.composer(correction, devices.slm.resolution())?;
        advance(&mut state, MeasurementState::GridPlanned);

        let acquired = self.acquire(devices, &composer, cancel, &mut state);
        let (background_shape, interferograms) = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                log::warn!("measurement aborted: {e}");
                if let Err(restore) = devices.load_mask(composer.block()) {
                    log::error!("cannot restore the SLM block mask: {restore}");
                }
                return Err(e);
            }
        };
        let degraded_captures = interferograms.iter().filter(|i| i.degraded).count();

        let sine_fit = SineFit::new(
            background_shape,
            devices.camera.pixel_pitch(),
            self.wavelength,
            self.focal_length,
            self.fit.clone(),
        );
        let center = self.grid.center();
        let pitch = devices.slm.pitch();
        let offsets: Vec<_> = self
            .roi
            .iter()
            .map(|&index| self.grid.apertures()[index].offset_from(center, pitch))
            .collect();
        let fit_results = sine_fit.fit_all(&interferograms, &offsets);
        advance(&mut state, MeasurementState::Fitted);

        let maps = WavefrontMaps::assemble(&fit_results, self.roi_window.size)?;
        advance(&mut state, MeasurementState::Assembled);
        sink.store(&maps)?;
        advance(&mut state, MeasurementState::Done);

        let summary = RunSummary {
            n_aperture: self.roi.len(),
            degraded_captures,
            failed_fits: maps.n_failed(),
            state,
        };
        log::info!("{summary}");
        Ok((maps, summary))
    }
    /// Records the background and the interferograms of the ROI
    fn acquire<S, C, H>(
        &self,
        devices: &mut Devices<S, C, H>,
        composer: &PhaseMaskComposer,
        cancel: &CancelToken,
        state: &mut MeasurementState,
    ) -> crate::Result<((usize, usize), Vec<crate::Interferogram>)>
    where
        S: SpatialLightModulator,
        C: Camera,
        H: Shutter,
    {
        let background = self
            .acquisition
            .capture_background(devices, composer.block())?;
        advance(state, MeasurementState::BackgroundCaptured);
        if let Some(&first) = self.roi.first() {
            advance(state, MeasurementState::Looping(first));
        }
        let interferograms = self.acquisition.run_loop(
            devices,
            &self.roi,
            &background,
            composer,
            cancel,
            Some(progress_bar(self.roi.len())),
        )?;
        Ok((background.frame().shape(), interferograms))
    }
}
