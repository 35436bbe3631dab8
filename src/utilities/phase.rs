use nalgebra::DMatrix;

/// Normalizes the values of an array to the range [0,1]
///
/// A constant array is returned unchanged
pub fn normalize(data: &DMatrix<f64>) -> DMatrix<f64> {
    let min = data.min();
    let max = data.max();
    if max > min {
        data.map(|x| (x - min) / (max - min))
    } else {
        data.clone()
    }
}

/// Wraps a normalized phase (1 is 2π) into [0,1)
#[inline]
pub fn wrap(phase: f64) -> f64 {
    let w = phase.rem_euclid(1.0);
    // rem_euclid may round up to the modulus for tiny negative inputs
    if w < 1.0 {
        w
    } else {
        0.0
    }
}

/// Linear phase grating along the SLM columns
///
/// Every row reads `(col mod period) / period`, a sawtooth from 0 to `(period-1)/period`
pub fn linear_grating((n_row, n_col): (usize, usize), period_px: usize) -> DMatrix<f64> {
    let period = period_px.max(1);
    DMatrix::from_fn(n_row, n_col, |_, j| (j % period) as f64 / period as f64)
}

/// Returns the (x,y) coordinates in meters of the pixels of a `n_row`x`n_col` detector
///
/// The grid is centered on the pixel at (`n_row`/2,`n_col`/2), rounded up, and `x` runs along the columns
pub fn centered_meshgrid(n_row: usize, n_col: usize, pitch: f64) -> (DMatrix<f64>, DMatrix<f64>) {
    let i0 = n_row.div_ceil(2) as f64;
    let j0 = n_col.div_ceil(2) as f64;
    let x = DMatrix::from_fn(n_row, n_col, |_, j| (j as f64 - j0) * pitch);
    let y = DMatrix::from_fn(n_row, n_col, |i, _| (i as f64 - i0) * pitch);
    (x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_range() {
        let data = DMatrix::from_row_slice(2, 2, &[2., 4., 6., 10.]);
        let n = normalize(&data);
        assert_eq!(n.min(), 0.);
        assert_eq!(n.max(), 1.);
        assert!((n[(0, 1)] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn normalize_constant() {
        let data = DMatrix::from_element(3, 3, 0.7);
        assert_eq!(normalize(&data), data);
    }

    #[test]
    fn wrap_negative() {
        assert!((wrap(-0.25) - 0.75).abs() < 1e-12);
        assert!((wrap(1.5) - 0.5).abs() < 1e-12);
        assert!(wrap(-1e-18) < 1.);
    }

    #[test]
    fn grating_sawtooth() {
        let g = linear_grating((2, 10), 4);
        assert_eq!(g[(1, 0)], 0.);
        assert_eq!(g[(0, 3)], 0.75);
        assert_eq!(g[(0, 4)], 0.);
    }

    #[test]
    fn meshgrid_centered() {
        let (x, y) = centered_meshgrid(4, 5, 2.);
        assert_eq!(x[(0, 0)], -6.);
        assert_eq!(x[(0, 3)], 0.);
        assert_eq!(y[(2, 0)], 0.);
        assert_eq!(y[(0, 4)], -4.);
    }
}
