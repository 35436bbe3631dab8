//! Software measurement bench
//!
//! The simulated SLM, camera and shutter share the state of the bench.
//! An aperture is open when the codes on its footprint are not all the same, i.e. when the
//! baseline grating is displayed on it.
//! For every pair of open apertures (i,j), the camera renders the interference term
//! `a_i a_j cos(k(dx x + dy y)/f + φ_j - φ_i)` where (dx,dy) is the displacement of aperture j
//! with respect to aperture i, over a dark level and an optional uniform read noise.

use std::{
    collections::VecDeque,
    f64::consts::PI,
    sync::{Arc, Mutex, MutexGuard},
};

use nalgebra::DMatrix;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{utilities::centered_meshgrid, ApertureGrid, ApertureGridBuilder, Builder, FromBuilder};

use super::{Camera, DeviceError, Devices, Frame, Shutter, SpatialLightModulator};

/// Bench activity log entry
#[derive(Debug, Clone, PartialEq)]
pub enum BenchEvent {
    /// A phase pattern was loaded with the given apertures open
    Load { open: Vec<usize> },
    Shutter(bool),
    Configure { exposure: f64, frame_count: usize },
    /// A frame was captured with the light of the given apertures
    Capture { open: Vec<usize> },
}

/// Returns the apertures of the grid with a non-flat footprint
fn open_apertures(grid: &ApertureGrid, codes: &DMatrix<u8>) -> Vec<usize> {
    grid.apertures()
        .iter()
        .filter(|a| {
            let footprint = codes.view((a.top, a.left), (a.height(), a.width()));
            let first = footprint[(0, 0)];
            footprint.iter().any(|&c| c != first)
        })
        .map(|a| a.index)
        .collect()
}

struct BenchState {
    codes: Option<DMatrix<u8>>,
    shutter_open: bool,
    frame_count: usize,
    n_capture: usize,
    failing_captures: VecDeque<usize>,
    events: Vec<BenchEvent>,
    rng: StdRng,
}

#[derive(Clone)]
struct SharedState(Arc<Mutex<BenchState>>);
impl SharedState {
    fn lock(&self) -> Result<MutexGuard<'_, BenchState>, DeviceError> {
        self.0
            .lock()
            .map_err(|_| DeviceError::Config("the simulated bench state is poisoned".into()))
    }
}

/// [`SimulatedBench`] builder
///
/// Default properties:
///  * SLM              : 512x512px, 12.5μm pitch, 198 modulation depth
///  * aperture grid    : 8x8 apertures of 64px
///  * camera           : 128x128px, 6.5μm pitch
///  * wavelength       : 752nm
///  * focal length     : 0.3m
///  * aberration       : none, unit amplitudes
///  * dark level       : 100
///  * read noise       : 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedBenchBuilder {
    pub slm_resolution: (usize, usize),
    pub slm_pitch: f64,
    pub modulation_depth: u8,
    pub grid: ApertureGridBuilder,
    pub camera_resolution: (usize, usize),
    pub camera_pitch: f64,
    pub wavelength: f64,
    pub focal_length: f64,
    pub phase: Option<Vec<f64>>,
    pub amplitude: Option<Vec<f64>>,
    pub dark_level: f64,
    pub read_noise: f64,
    pub seed: u64,
    pub failing_captures: Vec<usize>,
}
impl Default for SimulatedBenchBuilder {
    fn default() -> Self {
        Self {
            slm_resolution: (512, 512),
            slm_pitch: 12.5e-6,
            modulation_depth: 198,
            grid: ApertureGridBuilder::default().extent(512, 512),
            camera_resolution: (128, 128),
            camera_pitch: 6.5e-6,
            wavelength: 752e-9,
            focal_length: 0.3,
            phase: None,
            amplitude: None,
            dark_level: 100.,
            read_noise: 0.,
            seed: 0,
            failing_captures: vec![],
        }
    }
}
impl SimulatedBenchBuilder {
    /// Set the SLM (rows,cols) resolution
    ///
    /// The usable extent of the aperture grid is reset to the square part of the SLM
    pub fn slm_resolution(self, rows: usize, cols: usize) -> Self {
        Self {
            slm_resolution: (rows, cols),
            grid: self.grid.square_extent((rows, cols)),
            ..self
        }
    }
    /// Set the aperture grid the apertures of the bench are matched against
    pub fn grid(self, grid: ApertureGridBuilder) -> Self {
        Self { grid, ..self }
    }
    /// Set the camera (rows,cols) resolution and pixel pitch in meters
    pub fn camera(self, rows: usize, cols: usize, pitch: f64) -> Self {
        Self {
            camera_resolution: (rows, cols),
            camera_pitch: pitch,
            ..self
        }
    }
    /// Set the wavelength and the focal length in meters
    pub fn optics(self, wavelength: f64, focal_length: f64) -> Self {
        Self {
            wavelength,
            focal_length,
            ..self
        }
    }
    /// Set the phase in radians of each aperture of the grid
    pub fn phase(self, phase: Vec<f64>) -> Self {
        Self {
            phase: Some(phase),
            ..self
        }
    }
    /// Set the field amplitude of each aperture of the grid
    pub fn amplitude(self, amplitude: Vec<f64>) -> Self {
        Self {
            amplitude: Some(amplitude),
            ..self
        }
    }
    /// Set the camera dark level
    pub fn dark_level(self, dark_level: f64) -> Self {
        Self { dark_level, ..self }
    }
    /// Set the amplitude of the uniform read noise and the seed of the noise generator
    pub fn read_noise(self, read_noise: f64, seed: u64) -> Self {
        Self {
            read_noise,
            seed,
            ..self
        }
    }
    /// Set the captures, counted from 0, that fail
    pub fn failing_captures(self, failing_captures: Vec<usize>) -> Self {
        Self {
            failing_captures,
            ..self
        }
    }
}

impl Builder for SimulatedBenchBuilder {
    type Component = SimulatedBench;

    fn build(self) -> crate::Result<Self::Component> {
        let grid = self.grid.build()?;
        let n = grid.len();
        let phase = self.phase.unwrap_or_else(|| vec![0.; n]);
        let amplitude = self.amplitude.unwrap_or_else(|| vec![1.; n]);
        if phase.len() != n || amplitude.len() != n {
            return Err(DeviceError::Config(format!(
                "expected {n} aperture phases and amplitudes, found {} and {}",
                phase.len(),
                amplitude.len()
            ))
            .into());
        }
        let (_, bottom, _, right) = grid.region();
        if bottom > self.slm_resolution.0 || right > self.slm_resolution.1 {
            return Err(DeviceError::Config(format!(
                "the aperture grid does not fit in the {:?} SLM",
                self.slm_resolution
            ))
            .into());
        }
        let (rows, cols) = self.camera_resolution;
        let (x, y) = centered_meshgrid(rows, cols, self.camera_pitch);
        let mut failing_captures: Vec<_> = self.failing_captures;
        failing_captures.sort_unstable();
        let state = SharedState(Arc::new(Mutex::new(BenchState {
            codes: None,
            shutter_open: false,
            frame_count: 1,
            n_capture: 0,
            failing_captures: failing_captures.into(),
            events: vec![],
            rng: StdRng::seed_from_u64(self.seed),
        })));
        Ok(SimulatedBench {
            slm: SimulatedSlm {
                grid: grid.clone(),
                resolution: self.slm_resolution,
                pitch: self.slm_pitch,
                modulation_depth: self.modulation_depth,
                state: state.clone(),
            },
            camera: SimulatedCamera {
                grid,
                slm_pitch: self.slm_pitch,
                k: 2. * PI / self.wavelength,
                focal_length: self.focal_length,
                pitch: self.camera_pitch,
                x,
                y,
                phase,
                amplitude,
                dark_level: self.dark_level,
                read_noise: self.read_noise,
                state: state.clone(),
            },
            shutter: SimulatedShutter { state },
        })
    }
}

/// Software measurement bench
pub struct SimulatedBench {
    pub slm: SimulatedSlm,
    pub camera: SimulatedCamera,
    pub shutter: SimulatedShutter,
}
impl FromBuilder for SimulatedBench {
    type ComponentBuilder = SimulatedBenchBuilder;
}
impl SimulatedBench {
    pub fn into_devices(self) -> Devices<SimulatedSlm, SimulatedCamera, SimulatedShutter> {
        Devices::new(self.slm, self.camera, self.shutter)
    }
}

/// Simulated SLM
pub struct SimulatedSlm {
    grid: ApertureGrid,
    resolution: (usize, usize),
    pitch: f64,
    modulation_depth: u8,
    state: SharedState,
}
impl SimulatedSlm {
    /// Returns the bench activity log
    pub fn events(&self) -> Vec<BenchEvent> {
        self.state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }
    /// Returns the last pattern loaded on the SLM
    pub fn last_codes(&self) -> Option<DMatrix<u8>> {
        self.state.lock().ok().and_then(|state| state.codes.clone())
    }
}
impl SpatialLightModulator for SimulatedSlm {
    fn resolution(&self) -> (usize, usize) {
        self.resolution
    }
    fn pitch(&self) -> f64 {
        self.pitch
    }
    fn modulation_depth(&self) -> u8 {
        self.modulation_depth
    }
    fn load_phase(&mut self, codes: &DMatrix<u8>) -> Result<(), DeviceError> {
        if codes.shape() != self.resolution {
            return Err(DeviceError::Slm(format!(
                "expected {:?} codes, found {:?}",
                self.resolution,
                codes.shape()
            )));
        }
        if let Some(code) = codes.iter().find(|&&c| c > self.modulation_depth) {
            return Err(DeviceError::Slm(format!(
                "code {code} exceeds the modulation depth {}",
                self.modulation_depth
            )));
        }
        let open = open_apertures(&self.grid, codes);
        let mut state = self.state.lock()?;
        state.codes = Some(codes.clone());
        state.events.push(BenchEvent::Load { open });
        Ok(())
    }
}

/// Simulated camera
pub struct SimulatedCamera {
    grid: ApertureGrid,
    slm_pitch: f64,
    k: f64,
    focal_length: f64,
    pitch: f64,
    x: DMatrix<f64>,
    y: DMatrix<f64>,
    phase: Vec<f64>,
    amplitude: Vec<f64>,
    dark_level: f64,
    read_noise: f64,
    state: SharedState,
}
impl SimulatedCamera {
    /// Renders the fringes of the open apertures
    pub fn render(&self, open: &[usize]) -> Frame {
        let mut frame = Frame::from_element(self.x.nrows(), self.x.ncols(), self.dark_level);
        for (n, &i) in open.iter().enumerate() {
            for &j in &open[n + 1..] {
                let (dx, dy) = self.grid.apertures()[j]
                    .offset_from(&self.grid.apertures()[i], self.slm_pitch);
                let kx = self.k * dx / self.focal_length;
                let ky = self.k * dy / self.focal_length;
                let dphi = self.phase[j] - self.phase[i];
                let a = self.amplitude[i] * self.amplitude[j];
                frame
                    .iter_mut()
                    .zip(self.x.iter().zip(self.y.iter()))
                    .for_each(|(f, (x, y))| *f += a * (kx * x + ky * y + dphi).cos());
            }
        }
        frame
    }
}
impl Camera for SimulatedCamera {
    fn configure(&mut self, exposure: f64, frame_count: usize) -> Result<(), DeviceError> {
        if frame_count == 0 {
            return Err(DeviceError::Camera(
                "at least one frame must be averaged".into(),
            ));
        }
        let mut state = self.state.lock()?;
        state.frame_count = frame_count;
        state.events.push(BenchEvent::Configure {
            exposure,
            frame_count,
        });
        Ok(())
    }
    fn capture_averaged(&mut self) -> Result<Frame, DeviceError> {
        let mut state = self.state.lock()?;
        let n_capture = state.n_capture;
        state.n_capture += 1;
        if state.failing_captures.front() == Some(&n_capture) {
            state.failing_captures.pop_front();
            return Err(DeviceError::Camera(format!(
                "simulated failure of capture #{n_capture}"
            )));
        }
        let open = match (&state.codes, state.shutter_open) {
            (Some(codes), true) => open_apertures(&self.grid, codes),
            _ => vec![],
        };
        let mut frame = self.render(&open);
        if self.read_noise > 0. {
            let frame_count = state.frame_count;
            let r = self.read_noise;
            frame.iter_mut().for_each(|f| {
                *f += (0..frame_count)
                    .map(|_| state.rng.gen_range(-r..=r))
                    .sum::<f64>()
                    / frame_count as f64
            });
        }
        state.events.push(BenchEvent::Capture { open });
        Ok(frame)
    }
    fn pixel_pitch(&self) -> f64 {
        self.pitch
    }
}

/// Simulated shutter
pub struct SimulatedShutter {
    state: SharedState,
}
impl Shutter for SimulatedShutter {
    fn enable(&mut self, open: bool) -> Result<(), DeviceError> {
        let mut state = self.state.lock()?;
        state.shutter_open = open;
        state.events.push(BenchEvent::Shutter(open));
        Ok(())
    }
}
