//! Bounded Levenberg-Marquardt least-squares for 3-parameter image models
//!
//! The bounds are enforced by projecting every trial step onto the feasible box.

use nalgebra::{Matrix3, Vector3};

use super::FitConfig;

/// Model of an image sampled at (x,y) coordinates
pub(super) trait ImageModel {
    /// Returns the model value and its partial derivatives with respect to the parameters
    fn evaluate_and_jacobian(&self, x: f64, y: f64, params: &Vector3<f64>) -> (f64, [f64; 3]);
    fn evaluate(&self, x: f64, y: f64, params: &Vector3<f64>) -> f64;
}

/// Image samples
pub(super) struct Samples<'a> {
    pub x: &'a [f64],
    pub y: &'a [f64],
    pub z: &'a [f64],
}
impl Samples<'_> {
    fn len(&self) -> usize {
        self.z.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Status {
    Converged,
    MaxEvaluations,
    DampingOverflow,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Outcome {
    pub params: Vector3<f64>,
    pub chi2: f64,
    /// JᵀJ at `params`
    pub hessian: Matrix3<f64>,
    pub status: Status,
    pub n_evaluations: usize,
}

fn project(p: &Vector3<f64>, lower: &Vector3<f64>, upper: &Vector3<f64>) -> Vector3<f64> {
    Vector3::from_fn(|i, _| p[i].clamp(lower[i], upper[i]))
}

fn chi2<M: ImageModel>(model: &M, samples: &Samples, params: &Vector3<f64>) -> f64 {
    samples
        .x
        .iter()
        .zip(samples.y)
        .zip(samples.z)
        .map(|((&x, &y), &z)| {
            let r = z - model.evaluate(x, y, params);
            r * r
        })
        .sum()
}

/// Returns JᵀJ, Jᵀr and χ²
#[allow(clippy::needless_range_loop)]
fn normal_equations<M: ImageModel>(
    model: &M,
    samples: &Samples,
    params: &Vector3<f64>,
) -> (Matrix3<f64>, Vector3<f64>, f64) {
    let mut h = [[0f64; 3]; 3];
    let mut g = [0f64; 3];
    let mut chi2 = 0f64;
    for ((&x, &y), &z) in samples.x.iter().zip(samples.y).zip(samples.z) {
        let (value, row) = model.evaluate_and_jacobian(x, y, params);
        let r = z - value;
        chi2 += r * r;
        for i in 0..3 {
            g[i] += row[i] * r;
            for j in i..3 {
                h[i][j] += row[i] * row[j];
            }
        }
    }
    let hessian = Matrix3::from_fn(|i, j| if i <= j { h[i][j] } else { h[j][i] });
    (hessian, Vector3::from(g), chi2)
}

/// Minimizes the χ² of the model within the box [`lower`,`upper`]
///
/// Every pass over the samples counts as one evaluation; the optimizer gives up after
/// `config.max_evaluations` evaluations or when the damping exceeds `config.max_lambda`
pub(super) fn optimize<M: ImageModel>(
    model: &M,
    samples: &Samples,
    initial: Vector3<f64>,
    (lower, upper): (Vector3<f64>, Vector3<f64>),
    config: &FitConfig,
) -> Outcome {
    let mut params = project(&initial, &lower, &upper);
    let (mut hessian, mut gradient, mut chi2_0) = normal_equations(model, samples, &params);
    let mut n_evaluations = 1;
    let mut lambda = config.initial_lambda;
    let outcome = |params, chi2, hessian, status, n_evaluations| Outcome {
        params,
        chi2,
        hessian,
        status,
        n_evaluations,
    };

    if samples.len() == 0 || chi2_0 <= f64::MIN_POSITIVE {
        return outcome(params, chi2_0, hessian, Status::Converged, n_evaluations);
    }

    loop {
        if n_evaluations >= config.max_evaluations {
            return outcome(params, chi2_0, hessian, Status::MaxEvaluations, n_evaluations);
        }
        if lambda > config.max_lambda {
            return outcome(params, chi2_0, hessian, Status::DampingOverflow, n_evaluations);
        }

        // Marquardt scaling, with a floor for the parameters the image is insensitive to
        let floor = hessian.diagonal().max() * 1e-12 + f64::MIN_POSITIVE;
        let mut damped = hessian;
        for i in 0..3 {
            damped[(i, i)] += lambda * hessian[(i, i)].max(floor);
        }
        let Some(delta) = damped.cholesky().map(|c| c.solve(&gradient)) else {
            lambda *= config.lambda_up;
            continue;
        };

        let trial = project(&(params + delta), &lower, &upper);
        let step = trial - params;
        let is_small = step
            .iter()
            .zip(params.iter())
            .all(|(s, p)| s.abs() <= config.x_tolerance * (p.abs() + config.x_tolerance));

        let chi2_trial = chi2(model, samples, &trial);
        n_evaluations += 1;

        if chi2_trial < chi2_0 {
            params = trial;
            lambda = (lambda * config.lambda_down).max(config.min_lambda);
            (hessian, gradient, chi2_0) = normal_equations(model, samples, &params);
            n_evaluations += 1;
            if is_small || chi2_0 <= f64::MIN_POSITIVE {
                return outcome(params, chi2_0, hessian, Status::Converged, n_evaluations);
            }
        } else if is_small {
            return outcome(params, chi2_0, hessian, Status::Converged, n_evaluations);
        } else {
            lambda *= config.lambda_up;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// z = p0 + p1 x + p2 y
    struct Plane;
    impl ImageModel for Plane {
        fn evaluate_and_jacobian(&self, x: f64, y: f64, p: &Vector3<f64>) -> (f64, [f64; 3]) {
            (self.evaluate(x, y, p), [1., x, y])
        }
        fn evaluate(&self, x: f64, y: f64, p: &Vector3<f64>) -> f64 {
            p[0] + p[1] * x + p[2] * y
        }
    }

    fn plane_samples() -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let (x, y): (Vec<f64>, Vec<f64>) = (0..100)
            .map(|i| ((i % 10) as f64, (i / 10) as f64))
            .unzip();
        let z = x.iter().zip(&y).map(|(x, y)| 1.5 - 0.5 * x + 2. * y).collect();
        (x, y, z)
    }

    #[test]
    fn unconstrained_plane() {
        let (x, y, z) = plane_samples();
        let samples = Samples {
            x: &x,
            y: &y,
            z: &z,
        };
        let bounds = (Vector3::from_element(-10.), Vector3::from_element(10.));
        let o = optimize(
            &Plane,
            &samples,
            Vector3::zeros(),
            bounds,
            &FitConfig::default(),
        );
        assert_eq!(o.status, Status::Converged);
        assert!((o.params - Vector3::new(1.5, -0.5, 2.)).amax() < 1e-6);
    }

    #[test]
    fn bounded_plane() {
        let (x, y, z) = plane_samples();
        let samples = Samples {
            x: &x,
            y: &y,
            z: &z,
        };
        let bounds = (Vector3::new(-10., 0., -10.), Vector3::from_element(10.));
        let o = optimize(
            &Plane,
            &samples,
            Vector3::new(0., 1., 0.),
            bounds,
            &FitConfig::default(),
        );
        assert_eq!(o.status, Status::Converged);
        assert_eq!(o.params[1], 0.);
    }

    #[test]
    fn evaluation_cap() {
        let (x, y, z) = plane_samples();
        let samples = Samples {
            x: &x,
            y: &y,
            z: &z,
        };
        let bounds = (Vector3::from_element(-10.), Vector3::from_element(10.));
        let config = FitConfig {
            max_evaluations: 2,
            ..Default::default()
        };
        let o = optimize(&Plane, &samples, Vector3::zeros(), bounds, &config);
        assert_eq!(o.status, Status::MaxEvaluations);
        assert!(o.n_evaluations <= 3);
    }
}
