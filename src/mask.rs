//!
//! # SLM phase masks
//!
//! A [`PhaseMask`] is a normalized phase pattern (1 is 2π) the size of the SLM.
//! The [`PhaseMaskComposer`] builds the masks of an interferometric measurement from two patterns:
//!  * the baseline pattern, a grating that steers the light of an open aperture toward the camera,
//!  * the block pattern, shown everywhere else so that the light of the closed apertures misses the camera.
//!
//! The apertures that are open at a given time are given by a [`MaskLayer`].

use std::ops::Deref;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::{
    utilities::{linear_grating, normalize, wrap},
    Aperture, ApertureError, ApertureGrid,
};

#[derive(Debug, thiserror::Error)]
pub enum MaskError {
    #[error("expected a {expected:?} phase mask, found {found:?}")]
    Shape {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("the aperture grid region {region:?} is outside the {shape:?} phase mask")]
    Footprint {
        region: (usize, usize, usize, usize),
        shape: (usize, usize),
    },
    #[error("invalid aperture")]
    Aperture(#[from] ApertureError),
}

/// Normalized phase pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMask(DMatrix<f64>);
impl Deref for PhaseMask {
    type Target = DMatrix<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl From<DMatrix<f64>> for PhaseMask {
    fn from(value: DMatrix<f64>) -> Self {
        Self(value)
    }
}
impl From<PhaseMask> for DMatrix<f64> {
    fn from(value: PhaseMask) -> Self {
        value.0
    }
}
impl PhaseMask {
    /// Flat phase mask of (rows,cols) pixels
    pub fn zeros((n_row, n_col): (usize, usize)) -> Self {
        Self(DMatrix::zeros(n_row, n_col))
    }
    /// Phase mask from raw pattern values, e.g. the gray levels of a correction image, rescaled to [0,1]
    pub fn normalized(raw: &DMatrix<f64>) -> Self {
        Self(normalize(raw))
    }
    /// Linear grating with a period of `period_px` pixels along the columns
    pub fn grating(shape: (usize, usize), period_px: usize) -> Self {
        Self(linear_grating(shape, period_px))
    }
    /// Grating with a correction pattern on top of it
    ///
    /// Loading this mask on a corrected SLM yields a clean first diffraction order
    pub fn test_pattern(correction: &PhaseMask, period_px: usize) -> Self {
        Self::grating(correction.shape(), period_px).superpose_unchecked(correction)
    }
    /// Returns the (rows,cols) size of the mask
    pub fn shape(&self) -> (usize, usize) {
        self.0.shape()
    }
    /// Adds two phase masks and wraps the result into [0,1)
    pub fn superpose(&self, other: &PhaseMask) -> Result<Self, MaskError> {
        if self.shape() != other.shape() {
            return Err(MaskError::Shape {
                expected: self.shape(),
                found: other.shape(),
            });
        }
        Ok(self.superpose_unchecked(other))
    }
    fn superpose_unchecked(&self, other: &PhaseMask) -> Self {
        Self(self.0.zip_map(&other.0, |a, b| wrap(a + b)))
    }
    /// Returns the part of the mask covered by the aperture
    pub fn footprint(&self, aperture: &Aperture) -> DMatrix<f64> {
        self.0
            .view(
                (aperture.top, aperture.left),
                (aperture.height(), aperture.width()),
            )
            .into_owned()
    }
    /// Copies the footprint of the aperture in `source` into the same footprint of the mask
    fn paint(&mut self, source: &PhaseMask, aperture: &Aperture) {
        let start = (aperture.top, aperture.left);
        let shape = (aperture.height(), aperture.width());
        self.0
            .view_mut(start, shape)
            .copy_from(&source.0.view(start, shape));
    }
    /// Converts the mask into SLM codes
    ///
    /// The phase is wrapped into [0,1) and scaled by the `modulation_depth`, the code value of a 2π phase shift
    pub fn to_codes(&self, modulation_depth: u8) -> DMatrix<u8> {
        let depth = modulation_depth as f64;
        self.0
            .map(|p| (wrap(p) * depth).floor().clamp(0., depth) as u8)
    }
}

/// The apertures open on the SLM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskLayer {
    /// No aperture is open
    BackgroundOnly,
    /// Only the reference aperture is open
    ReferenceOnly,
    /// The reference aperture and the aperture at the given index are open
    ReferenceAndTest(usize),
}

/// Phase masks of an interferometric measurement
///
/// The composer is immutable, every mask is a new [`PhaseMask`]
#[derive(Debug, Clone)]
pub struct PhaseMaskComposer {
    baseline: PhaseMask,
    block: PhaseMask,
    grid: ApertureGrid,
}
impl PhaseMaskComposer {
    /// Creates a new composer from the `baseline` and `block` patterns
    ///
    /// Both patterns must have the same shape and the aperture grid must fit within them
    pub fn new(
        baseline: PhaseMask,
        block: PhaseMask,
        grid: ApertureGrid,
    ) -> Result<Self, MaskError> {
        if baseline.shape() != block.shape() {
            return Err(MaskError::Shape {
                expected: baseline.shape(),
                found: block.shape(),
            });
        }
        let (n_row, n_col) = baseline.shape();
        let region = grid.region();
        if region.1 > n_row || region.3 > n_col {
            return Err(MaskError::Footprint {
                region,
                shape: (n_row, n_col),
            });
        }
        Ok(Self {
            baseline,
            block,
            grid,
        })
    }
    /// Creates a new composer with a flat block pattern
    pub fn with_flat_block(baseline: PhaseMask, grid: ApertureGrid) -> Result<Self, MaskError> {
        let block = PhaseMask::zeros(baseline.shape());
        Self::new(baseline, block, grid)
    }
    pub fn baseline(&self) -> &PhaseMask {
        &self.baseline
    }
    pub fn block(&self) -> &PhaseMask {
        &self.block
    }
    pub fn grid(&self) -> &ApertureGrid {
        &self.grid
    }
    /// Returns the mask with only the reference aperture open
    pub fn build_center_mask(&self) -> PhaseMask {
        let mut mask = self.block.clone();
        mask.paint(&self.baseline, self.grid.center());
        mask
    }
    /// Returns a copy of `center_mask` with the aperture at `test_index` open as well
    ///
    /// The footprint of the reference aperture is left untouched
    pub fn build_test_mask(
        &self,
        center_mask: &PhaseMask,
        test_index: usize,
    ) -> Result<PhaseMask, MaskError> {
        if center_mask.shape() != self.baseline.shape() {
            return Err(MaskError::Shape {
                expected: self.baseline.shape(),
                found: center_mask.shape(),
            });
        }
        let aperture = self.grid.get(test_index)?;
        let mut mask = center_mask.clone();
        mask.paint(&self.baseline, aperture);
        Ok(mask)
    }
    /// Returns the mask for the given layer
    pub fn compose(&self, layer: MaskLayer) -> Result<PhaseMask, MaskError> {
        match layer {
            MaskLayer::BackgroundOnly => Ok(self.block.clone()),
            MaskLayer::ReferenceOnly => Ok(self.build_center_mask()),
            MaskLayer::ReferenceAndTest(index) => {
                self.build_test_mask(&self.build_center_mask(), index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Builder, FromBuilder};

    fn composer() -> PhaseMaskComposer {
        let grid = ApertureGrid::builder()
            .n_aperture(4)
            .aperture_width(8)
            .origin(2, 3)
            .extent(40, 48)
            .build()
            .unwrap();
        let baseline = PhaseMask::grating((40, 48), 5);
        let block = PhaseMask::from(DMatrix::from_element(40, 48, 0.1));
        PhaseMaskComposer::new(baseline, block, grid).unwrap()
    }

    #[test]
    fn center_mask() {
        let composer = composer();
        let mask = composer.build_center_mask();
        let center = composer.grid().center();
        assert_eq!(center.index, 9);
        assert_eq!(
            mask.footprint(center),
            composer.baseline().footprint(center)
        );
        let changed = mask
            .iter()
            .zip(composer.block().iter())
            .filter(|(m, b)| m != b)
            .count();
        let open = composer
            .baseline()
            .footprint(center)
            .iter()
            .filter(|&&b| b != 0.1)
            .count();
        assert_eq!(changed, open);
    }

    #[test]
    fn test_mask_keeps_center() {
        let composer = composer();
        let center_mask = composer.build_center_mask();
        let center = *composer.grid().center();
        for index in (0..16).filter(|&i| i != center.index) {
            let mask = composer.build_test_mask(&center_mask, index).unwrap();
            assert_eq!(mask.footprint(&center), center_mask.footprint(&center));
            let test = composer.grid().get(index).unwrap();
            assert_eq!(mask.footprint(test), composer.baseline().footprint(test));
        }
        assert_eq!(center_mask, composer.build_center_mask());
    }

    #[test]
    fn test_mask_closed_apertures() {
        let composer = composer();
        let mask = composer.compose(MaskLayer::ReferenceAndTest(0)).unwrap();
        let closed = composer.grid().get(15).unwrap();
        assert_eq!(mask.footprint(closed), composer.block().footprint(closed));
        assert_eq!(mask[(0, 0)], 0.1);
    }

    #[test]
    fn layers() {
        let composer = composer();
        assert_eq!(
            &composer.compose(MaskLayer::BackgroundOnly).unwrap(),
            composer.block()
        );
        assert_eq!(
            composer.compose(MaskLayer::ReferenceOnly).unwrap(),
            composer.build_center_mask()
        );
        assert!(matches!(
            composer.compose(MaskLayer::ReferenceAndTest(16)),
            Err(MaskError::Aperture(ApertureError::Index(16, 16)))
        ));
    }

    #[test]
    fn grid_outside_mask() {
        let grid = ApertureGrid::builder()
            .n_aperture(4)
            .aperture_width(16)
            .extent(64, 64)
            .build()
            .unwrap();
        assert!(matches!(
            PhaseMaskComposer::with_flat_block(PhaseMask::zeros((60, 64)), grid),
            Err(MaskError::Footprint { .. })
        ));
    }

    #[test]
    fn codes() {
        let mask = PhaseMask::from(DMatrix::from_row_slice(1, 4, &[0., 0.5, 0.999, 1.25]));
        let codes = mask.to_codes(198);
        assert_eq!(codes.as_slice(), &[0, 99, 197, 49]);
    }

    #[test]
    fn normalized_correction() {
        let raw = DMatrix::from_row_slice(2, 2, &[100., 150., 300., 200.]);
        let mask = PhaseMask::normalized(&raw);
        assert_eq!(mask.as_slice(), &[0., 1., 0.25, 0.5]);
    }

    #[test]
    fn superposition() {
        let a = PhaseMask::from(DMatrix::from_element(2, 2, 0.75));
        let b = PhaseMask::from(DMatrix::from_element(2, 2, 0.5));
        let c = a.superpose(&b).unwrap();
        assert!(c.iter().all(|x| (x - 0.25).abs() < 1e-12));
        assert!(a.superpose(&PhaseMask::zeros((2, 3))).is_err());
        let t = PhaseMask::test_pattern(&b, 4);
        assert!((t[(0, 3)] - 0.25).abs() < 1e-12);
    }
}
