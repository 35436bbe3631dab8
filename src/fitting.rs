//!
//! # Fringe fitting
//!
//! The interferogram of the reference aperture and of a test aperture displaced by (dx,dy) on the SLM
//! is modeled as
//!
//! I(x,y) = a1 a2 cos(kx x + ky y + φ)
//!
//! with (x,y) the camera coordinates in meters, kx = k dx/f and ky = k dy/f, k the wavenumber and f the
//! focal length of the Fourier lens.
//! φ is the phase of the test aperture relative to the reference aperture and a1 a2 is the product of
//! the amplitudes of the two beams.
//!
//! The fit is a bounded Levenberg-Marquardt least-squares minimization.
//! A fit that does not converge is not an error: it returns a zero [`FitResult`] flagged as not converged.

use std::f64::consts::{FRAC_PI_2, PI};

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{utilities::centered_meshgrid, Frame, Interferogram};

mod lm;
use lm::{ImageModel, Samples, Status};

/// Sine fit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Maximum number of model evaluations over the whole frame per optimizer run
    pub max_evaluations: usize,
    /// Relative parameter change below which the fit has converged
    pub x_tolerance: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    pub min_lambda: f64,
    /// Damping above which the fit is abandoned
    pub max_lambda: f64,
    /// Upper bound of the amplitudes relative to their initial guess
    pub amplitude_bound_factor: f64,
    /// Initial phases of the optimizer runs, the first one is the nominal initial guess
    pub phase_seeds: Vec<f64>,
}
impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_evaluations: 20_000,
            x_tolerance: 1e-10,
            initial_lambda: 1e-3,
            lambda_up: 10.,
            lambda_down: 0.1,
            min_lambda: 1e-9,
            max_lambda: 1e16,
            amplitude_bound_factor: 2.,
            phase_seeds: vec![0., FRAC_PI_2, -FRAC_PI_2, PI],
        }
    }
}

/// Result of the fit of an interferogram
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Phase of the test aperture relative to the reference aperture in radians
    pub phi: f64,
    pub a1: f64,
    pub a2: f64,
    /// Covariance of (φ,a1,a2)
    pub covariance: Matrix3<f64>,
    pub converged: bool,
    /// Sum of the squared residuals
    pub chi2: f64,
    pub n_evaluations: usize,
}
impl FitResult {
    /// Zero result of a failed fit
    pub fn failed(n_evaluations: usize) -> Self {
        Self {
            phi: 0.,
            a1: 0.,
            a2: 0.,
            covariance: Matrix3::zeros(),
            converged: false,
            chi2: 0.,
            n_evaluations,
        }
    }
    /// Returns |a1 a2|
    pub fn amplitude(&self) -> f64 {
        (self.a1 * self.a2).abs()
    }
    /// Returns the standard deviation of φ
    pub fn phase_error(&self) -> f64 {
        self.covariance[(0, 0)].max(0.).sqrt()
    }
}

struct Fringes {
    kx: f64,
    ky: f64,
}
impl ImageModel for Fringes {
    #[inline]
    fn evaluate_and_jacobian(&self, x: f64, y: f64, p: &Vector3<f64>) -> (f64, [f64; 3]) {
        let (phi, a1, a2) = (p[0], p[1], p[2]);
        let (s, c) = (self.kx * x + self.ky * y + phi).sin_cos();
        (a1 * a2 * c, [-a1 * a2 * s, a2 * c, a1 * c])
    }
    #[inline]
    fn evaluate(&self, x: f64, y: f64, p: &Vector3<f64>) -> f64 {
        p[1] * p[2] * (self.kx * x + self.ky * y + p[0]).cos()
    }
}

/// Two-beam interference fit
///
/// The camera coordinates are computed once for all the interferograms of a measurement
#[derive(Debug, Clone)]
pub struct SineFit {
    shape: (usize, usize),
    x: Vec<f64>,
    y: Vec<f64>,
    k: f64,
    focal_length: f64,
    config: FitConfig,
}
impl SineFit {
    /// Creates a new fit for (rows,cols) interferograms
    ///
    /// * `camera_pitch`: camera pixel size in meters
    /// * `wavelength`: laser wavelength in meters
    /// * `focal_length`: focal length of the lens between the SLM and the camera in meters
    pub fn new(
        shape: (usize, usize),
        camera_pitch: f64,
        wavelength: f64,
        focal_length: f64,
        config: FitConfig,
    ) -> Self {
        let (x, y) = centered_meshgrid(shape.0, shape.1, camera_pitch);
        Self {
            shape,
            x: x.as_slice().to_vec(),
            y: y.as_slice().to_vec(),
            k: 2. * PI / wavelength,
            focal_length,
            config,
        }
    }
    pub fn config(&self) -> &FitConfig {
        &self.config
    }
    /// Returns the fringe wavevector (kx,ky) of an aperture displaced by (dx,dy) meters from the reference
    pub fn wavevector(&self, (dx, dy): (f64, f64)) -> (f64, f64) {
        (
            self.k * dx / self.focal_length,
            self.k * dy / self.focal_length,
        )
    }
    /// Fits the fringes of the interferogram with the wavevector (kx,ky)
    pub fn fit(&self, interferogram: &Frame, (kx, ky): (f64, f64)) -> FitResult {
        if interferogram.shape() != self.shape {
            log::warn!(
                "cannot fit a {:?} interferogram with a {:?} coordinate grid",
                interferogram.shape(),
                self.shape
            );
            return FitResult::failed(0);
        }
        let z = interferogram.as_slice();
        if z.iter().any(|v| !v.is_finite()) {
            log::warn!("cannot fit an interferogram with non-finite values");
            return FitResult::failed(0);
        }
        let a_guess = interferogram.max().sqrt() / 2.;
        if !(a_guess.is_finite() && a_guess > 0.) {
            log::warn!("no fringes to fit: the interferogram peak is not positive");
            return FitResult::failed(0);
        }
        let a_max = self.config.amplitude_bound_factor * a_guess;
        let bounds = (Vector3::new(-PI, 0., 0.), Vector3::new(PI, a_max, a_max));
        let model = Fringes { kx, ky };
        let samples = Samples {
            x: &self.x,
            y: &self.y,
            z,
        };

        let mut n_evaluations = 0;
        let mut best: Option<lm::Outcome> = None;
        for &phi0 in &self.config.phase_seeds {
            let outcome = lm::optimize(
                &model,
                &samples,
                Vector3::new(phi0, a_guess, a_guess),
                bounds,
                &self.config,
            );
            n_evaluations += outcome.n_evaluations;
            log::trace!(
                "seed {phi0:+.3}: {:?} after {} evaluations, χ²={:.3e}",
                outcome.status,
                outcome.n_evaluations,
                outcome.chi2
            );
            if outcome.status != Status::Converged {
                continue;
            }
            if best.map_or(true, |b| outcome.chi2 < b.chi2) {
                best = Some(outcome);
            }
        }

        let Some(best) = best else {
            log::warn!("fringe fit failed to converge after {n_evaluations} evaluations");
            return FitResult::failed(n_evaluations);
        };
        let n = z.len();
        let s2 = if n > 3 {
            best.chi2 / (n - 3) as f64
        } else {
            f64::INFINITY
        };
        let eps = best.hessian.amax() * 1e-12;
        let covariance = best
            .hessian
            .pseudo_inverse(eps)
            .map(|h| h * s2)
            .unwrap_or_else(|_| Matrix3::from_element(f64::INFINITY));
        FitResult {
            phi: best.params[0],
            a1: best.params[1],
            a2: best.params[2],
            covariance,
            converged: true,
            chi2: best.chi2,
            n_evaluations,
        }
    }
    /// Fits the interferograms in parallel
    ///
    /// `offsets` are the (dx,dy) displacements in meters of the apertures of the interferograms with
    /// respect to the reference aperture; the results are in the order of the interferograms
    pub fn fit_all(
        &self,
        interferograms: &[Interferogram],
        offsets: &[(f64, f64)],
    ) -> Vec<FitResult> {
        assert_eq!(
            interferograms.len(),
            offsets.len(),
            "expected as many aperture offsets as interferograms"
        );
        interferograms
            .par_iter()
            .zip(offsets.par_iter())
            .map(|(interferogram, &offset)| {
                let result = self.fit(&interferogram.frame, self.wavevector(offset));
                if !result.converged {
                    log::warn!("aperture #{}: fringe fit failed", interferogram.index);
                }
                result
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: (usize, usize) = (96, 96);
    const PITCH: f64 = 6.5e-6;
    const KXY: (f64, f64) = (20_000., -13_000.);

    fn fringes(phi: f64, a: f64, (kx, ky): (f64, f64)) -> Frame {
        let (x, y) = centered_meshgrid(SHAPE.0, SHAPE.1, PITCH);
        x.zip_map(&y, |x, y| a * (kx * x + ky * y + phi).cos())
    }

    fn sine_fit() -> SineFit {
        SineFit::new(SHAPE, PITCH, 752e-9, 0.3, FitConfig::default())
    }

    #[test]
    fn recovers_phase_and_amplitude() {
        let fit = sine_fit();
        for &phi in &[-3., -1.2, 0., 0.4, 2.5, 3.1] {
            let result = fit.fit(&fringes(phi, 400., KXY), KXY);
            assert!(result.converged, "φ={phi}");
            assert!((result.phi - phi).abs() < 1e-2, "φ={phi}: {}", result.phi);
            assert!(
                (result.amplitude() - 400.).abs() < 4.,
                "φ={phi}: {}",
                result.amplitude()
            );
            assert!(result.phase_error() < 1e-3);
        }
    }

    #[test]
    fn noisy_fringes() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(7);
        let data = fringes(1.1, 50., KXY).map(|v| v + rng.gen_range(-5f64..5.));
        let result = sine_fit().fit(&data, KXY);
        assert!(result.converged);
        assert!((result.phi - 1.1).abs() < 0.05);
        assert!(result.phase_error() > 0.);
    }

    #[test]
    fn zero_interferogram() {
        let result = sine_fit().fit(&Frame::zeros(SHAPE.0, SHAPE.1), KXY);
        assert!(!result.converged);
        assert_eq!(result.amplitude(), 0.);
        assert_eq!(result.phi, 0.);
        assert_eq!(result.covariance, Matrix3::zeros());
    }

    #[test]
    fn flat_interferogram() {
        let result = sine_fit().fit(&Frame::from_element(SHAPE.0, SHAPE.1, 5.), KXY);
        assert!(!result.converged || result.amplitude() < 0.25);
    }

    #[test]
    fn wrong_shape() {
        let result = sine_fit().fit(&Frame::from_element(10, 10, 1.), KXY);
        assert!(!result.converged);
    }

    #[test]
    fn evaluation_cap() {
        let config = FitConfig {
            max_evaluations: 1,
            ..Default::default()
        };
        let fit = SineFit::new(SHAPE, PITCH, 752e-9, 0.3, config);
        let result = fit.fit(&fringes(0.5, 10., KXY), KXY);
        assert!(!result.converged);
        assert_eq!(result.a1, 0.);
    }

    #[test]
    fn wavevector() {
        let fit = sine_fit();
        let (kx, ky) = fit.wavevector((1.6e-3, -8e-4));
        let k = 2. * PI / 752e-9;
        assert!((kx - k * 1.6e-3 / 0.3).abs() < 1e-6);
        assert!((ky + k * 8e-4 / 0.3).abs() < 1e-6);
    }

    #[test]
    fn parallel_fits_keep_order() {
        let fit = sine_fit();
        let phases = [0.3, -0.7, 1.9, -2.4];
        let k = 2. * PI / 752e-9;
        let offset = (KXY.0 * 0.3 / k, KXY.1 * 0.3 / k);
        let interferograms: Vec<_> = phases
            .iter()
            .enumerate()
            .map(|(index, &phi)| Interferogram {
                index,
                frame: fringes(phi, 100., KXY),
                degraded: false,
            })
            .collect();
        let results = fit.fit_all(&interferograms, &[offset; 4]);
        for (result, phi) in results.iter().zip(phases) {
            assert!((result.phi - phi).abs() < 1e-2);
        }
    }
}
