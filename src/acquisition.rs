//!
//! # Interferogram acquisition
//!
//! The [`AcquisitionSequencer`] records the camera background once and then, for every aperture of the
//! region of interest, displays the aperture together with the reference aperture and records the
//! background-subtracted interferogram.
//!
//! The capture of an interferogram requires the [`Background`] returned by
//! [`AcquisitionSequencer::capture_background`], so the background is always recorded first.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::{
    Camera, CancelToken, DeviceError, Devices, Frame, MeasurementError, PhaseMask,
    PhaseMaskComposer, Shutter, SpatialLightModulator,
};

/// Background recording mode
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackgroundMode {
    /// The background mask is displayed on the SLM with the shutter open,
    /// the background includes the light scattered by the SLM
    #[default]
    BlankPhase,
    /// The shutter is closed, the background is the camera dark frame
    ShutterClosed,
}

/// Camera background
#[derive(Debug, Clone)]
pub struct Background(Frame);
impl Background {
    pub fn frame(&self) -> &Frame {
        &self.0
    }
}

/// Background-subtracted camera frame of the reference aperture and of a test aperture
#[derive(Debug, Clone)]
pub struct Interferogram {
    /// Index of the test aperture
    pub index: usize,
    pub frame: Frame,
    /// `true` if the frame could not be captured, the frame is then zero
    pub degraded: bool,
}

/// Camera acquisition sequence
///
/// Default properties:
///  * exposure        : 5ms
///  * number of frames: 3
///  * capture retries : 2
///  * background      : [`BackgroundMode::BlankPhase`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSequencer {
    /// Camera exposure time in seconds
    pub exposure: f64,
    /// Number of frames averaged per capture
    pub num_frames: usize,
    /// Number of times a failed capture is repeated
    pub capture_retries: usize,
    pub background_mode: BackgroundMode,
}
impl Default for AcquisitionSequencer {
    fn default() -> Self {
        Self {
            exposure: 5e-3,
            num_frames: 3,
            capture_retries: 2,
            background_mode: BackgroundMode::default(),
        }
    }
}
impl AcquisitionSequencer {
    /// Captures an averaged frame, retrying up to `capture_retries` times
    fn capture<C: Camera>(&self, camera: &mut C) -> Result<Frame, DeviceError> {
        let mut attempt = 0;
        loop {
            match camera.capture_averaged() {
                Ok(frame) => return Ok(frame),
                Err(e) if attempt < self.capture_retries => {
                    attempt += 1;
                    log::warn!(
                        "capture failed ({e}), retrying ({attempt}/{})",
                        self.capture_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
    /// Records the camera background
    ///
    /// With [`BackgroundMode::BlankPhase`], `background_mask` is displayed on the SLM.
    /// The camera is configured for the measurement and the shutter is left open.
    /// A background that cannot be captured is a fatal error.
    pub fn capture_background<S, C, H>(
        &self,
        devices: &mut Devices<S, C, H>,
        background_mask: &PhaseMask,
    ) -> Result<Background, DeviceError>
    where
        S: SpatialLightModulator,
        C: Camera,
        H: Shutter,
    {
        match self.background_mode {
            BackgroundMode::BlankPhase => {
                devices.load_mask(background_mask)?;
                devices.shutter.enable(true)?;
            }
            BackgroundMode::ShutterClosed => devices.shutter.enable(false)?,
        }
        devices.camera.configure(self.exposure, self.num_frames)?;
        let frame = self.capture(&mut devices.camera)?;
        devices.shutter.enable(true)?;
        log::info!(
            "background recorded ({:?}): {}x{} frame, mean {:.3}",
            self.background_mode,
            frame.nrows(),
            frame.ncols(),
            frame.mean()
        );
        Ok(Background(frame))
    }
    /// Displays `mask` and records the interferogram of the aperture at `index`
    ///
    /// A capture that still fails after the retries gives a zero interferogram flagged as degraded,
    /// whereas a SLM failure or a frame that does not match the background are errors
    pub fn capture_aperture<S, C, H>(
        &self,
        devices: &mut Devices<S, C, H>,
        mask: &PhaseMask,
        index: usize,
        background: &Background,
    ) -> Result<Interferogram, DeviceError>
    where
        S: SpatialLightModulator,
        C: Camera,
        H: Shutter,
    {
        devices.load_mask(mask)?;
        let background = background.frame();
        match self.capture(&mut devices.camera) {
            Ok(frame) if frame.shape() != background.shape() => Err(DeviceError::FrameShape {
                expected: background.shape(),
                found: frame.shape(),
            }),
            Ok(frame) => Ok(Interferogram {
                index,
                frame: frame - background,
                degraded: false,
            }),
            Err(e) => {
                log::warn!(
                    "aperture #{index}: capture degraded after {} retries: {e}",
                    self.capture_retries
                );
                Ok(Interferogram {
                    index,
                    frame: Frame::zeros(background.nrows(), background.ncols()),
                    degraded: true,
                })
            }
        }
    }
    /// Records the interferograms of the apertures in `roi`, in the same order
    ///
    /// The cancellation token is checked before each aperture
    pub fn run_loop<S, C, H>(
        &self,
        devices: &mut Devices<S, C, H>,
        roi: &[usize],
        background: &Background,
        composer: &PhaseMaskComposer,
        cancel: &CancelToken,
        pb: Option<ProgressBar>,
    ) -> crate::Result<Vec<Interferogram>>
    where
        S: SpatialLightModulator,
        C: Camera,
        H: Shutter,
    {
        let center_mask = composer.build_center_mask();
        let mut interferograms = Vec::with_capacity(roi.len());
        for &index in roi {
            if cancel.is_cancelled() {
                pb.as_ref().map(|pb| pb.abandon());
                return Err(MeasurementError::Cancelled {
                    completed: interferograms.len(),
                    total: roi.len(),
                }
                .into());
            }
            let mask = composer.build_test_mask(&center_mask, index)?;
            let interferogram = self.capture_aperture(devices, &mask, index, background)?;
            log::debug!(
                "aperture #{index}: peak {:.3}{}",
                interferogram.frame.max(),
                if interferogram.degraded { " (degraded)" } else { "" }
            );
            interferograms.push(interferogram);
            pb.as_ref().map(|pb| pb.inc(1));
        }
        pb.as_ref().map(|pb| pb.finish());
        Ok(interferograms)
    }
}

/// Progress bar of the acquisition of `n` apertures
pub fn progress_bar(n: usize) -> ProgressBar {
    let pb = ProgressBar::new(n as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{msg} [{eta_precise}] {bar:50.cyan/blue} {pos:>7}/{len:7}")
    {
        pb.set_style(style);
    }
    pb.set_message("Recording interferograms");
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        devices::simulated::{BenchEvent, SimulatedBench},
        ApertureGridBuilder, Builder, FromBuilder, MaskLayer,
    };

    fn bench(failing_captures: Vec<usize>) -> SimulatedBench {
        SimulatedBench::builder()
            .slm_resolution(128, 128)
            .grid(
                ApertureGridBuilder::default()
                    .n_aperture(4)
                    .aperture_width(32)
                    .extent(128, 128),
            )
            .camera(32, 32, 6.5e-6)
            .failing_captures(failing_captures)
            .build()
            .unwrap()
    }

    fn composer() -> PhaseMaskComposer {
        let grid = ApertureGridBuilder::default()
            .n_aperture(4)
            .aperture_width(32)
            .extent(128, 128)
            .build()
            .unwrap();
        PhaseMaskComposer::with_flat_block(PhaseMask::grating((128, 128), 8), grid).unwrap()
    }

    #[test]
    fn blank_phase_background() {
        let bench = bench(vec![]);
        let composer = composer();
        let mut devices = bench.into_devices();
        let sequencer = AcquisitionSequencer::default();
        let background = sequencer
            .capture_background(&mut devices, composer.block())
            .unwrap();
        assert!(background.frame().iter().all(|&f| f == 100.));
        let events = devices.slm.events();
        assert_eq!(events[0], BenchEvent::Load { open: vec![] });
        assert_eq!(events[1], BenchEvent::Shutter(true));
        assert_eq!(
            events[2],
            BenchEvent::Configure {
                exposure: 5e-3,
                frame_count: 3
            }
        );
        assert_eq!(events[3], BenchEvent::Capture { open: vec![] });
        assert_eq!(events[4], BenchEvent::Shutter(true));
    }

    #[test]
    fn shutter_closed_background() {
        let bench = bench(vec![]);
        let composer = composer();
        let mut devices = bench.into_devices();
        let sequencer = AcquisitionSequencer {
            background_mode: BackgroundMode::ShutterClosed,
            ..Default::default()
        };
        sequencer
            .capture_background(&mut devices, composer.block())
            .unwrap();
        let events = devices.slm.events();
        assert_eq!(events[0], BenchEvent::Shutter(false));
        assert!(!events.iter().any(|e| matches!(e, BenchEvent::Load { .. })));
        assert_eq!(events.last(), Some(&BenchEvent::Shutter(true)));
    }

    #[test]
    fn background_subtraction() {
        let bench = bench(vec![]);
        let composer = composer();
        let mut devices = bench.into_devices();
        let sequencer = AcquisitionSequencer::default();
        let background = sequencer
            .capture_background(&mut devices, composer.block())
            .unwrap();
        let mask = composer.compose(MaskLayer::ReferenceAndTest(0)).unwrap();
        let interferogram = sequencer
            .capture_aperture(&mut devices, &mask, 0, &background)
            .unwrap();
        assert!(!interferogram.degraded);
        assert!(interferogram.frame.max() > 0.9 && interferogram.frame.min() < -0.9);
        assert!(interferogram.frame.max() <= 1. + 1e-9);
    }

    #[test]
    fn retries_then_degrades() {
        // capture #0 is the background
        let bench = bench(vec![1, 2, 4, 5, 6]);
        let composer = composer();
        let mut devices = bench.into_devices();
        let sequencer = AcquisitionSequencer::default();
        let background = sequencer
            .capture_background(&mut devices, composer.block())
            .unwrap();
        let mask = composer.compose(MaskLayer::ReferenceAndTest(0)).unwrap();
        let recovered = sequencer
            .capture_aperture(&mut devices, &mask, 0, &background)
            .unwrap();
        assert!(!recovered.degraded);
        let degraded = sequencer
            .capture_aperture(&mut devices, &mask, 0, &background)
            .unwrap();
        assert!(degraded.degraded);
        assert_eq!(degraded.frame.shape(), (32, 32));
        assert!(degraded.frame.iter().all(|&f| f == 0.));
    }

    #[test]
    fn failed_background() {
        let bench = bench(vec![0, 1, 2]);
        let composer = composer();
        let mut devices = bench.into_devices();
        let sequencer = AcquisitionSequencer::default();
        assert!(matches!(
            sequencer.capture_background(&mut devices, composer.block()),
            Err(DeviceError::Camera(_))
        ));
    }

    #[test]
    fn loop_in_roi_order() {
        let bench = bench(vec![]);
        let composer = composer();
        let mut devices = bench.into_devices();
        let sequencer = AcquisitionSequencer::default();
        let background = sequencer
            .capture_background(&mut devices, composer.block())
            .unwrap();
        let roi = [5, 6, 9, 10];
        let interferograms = sequencer
            .run_loop(
                &mut devices,
                &roi,
                &background,
                &composer,
                &CancelToken::default(),
                None,
            )
            .unwrap();
        let indices: Vec<_> = interferograms.iter().map(|i| i.index).collect();
        assert_eq!(indices, roi);
        let captured: Vec<_> = devices
            .slm
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BenchEvent::Capture { open } => Some(open),
                _ => None,
            })
            .collect();
        assert_eq!(
            captured,
            vec![vec![], vec![5, 9], vec![6, 9], vec![9], vec![9, 10]]
        );
    }

    #[test]
    fn cancelled_loop() {
        let bench = bench(vec![]);
        let composer = composer();
        let mut devices = bench.into_devices();
        let sequencer = AcquisitionSequencer::default();
        let background = sequencer
            .capture_background(&mut devices, composer.block())
            .unwrap();
        let cancel = CancelToken::default();
        cancel.cancel();
        let result =
            sequencer.run_loop(&mut devices, &[5, 6], &background, &composer, &cancel, None);
        assert!(matches!(
            result,
            Err(crate::SlmWavefrontError::Measurement(
                MeasurementError::Cancelled {
                    completed: 0,
                    total: 2
                }
            ))
        ));
    }
}
