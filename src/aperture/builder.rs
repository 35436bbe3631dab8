use serde::{Deserialize, Serialize};

use crate::Builder;

use super::ApertureGrid;

/// [`ApertureGrid`] builder
///
/// Default properties:
///  * number of apertures per side : 8
///  * aperture width               : 64px
///  * grid origin                  : (0,0)
///  * usable extent                : 1024x1024px (the square part of a 1024x1272 SLM)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApertureGridBuilder {
    pub n_aperture: usize,
    pub aperture_width: usize,
    pub origin: (usize, usize),
    pub extent: (usize, usize),
}
impl Default for ApertureGridBuilder {
    fn default() -> Self {
        Self {
            n_aperture: 8,
            aperture_width: 64,
            origin: (0, 0),
            extent: (1024, 1024),
        }
    }
}
impl ApertureGridBuilder {
    /// Set the number of apertures along one side of the grid
    pub fn n_aperture(self, n_aperture: usize) -> Self {
        Self { n_aperture, ..self }
    }
    /// Set the width of the apertures in pixels
    pub fn aperture_width(self, aperture_width: usize) -> Self {
        Self {
            aperture_width,
            ..self
        }
    }
    /// Set the SLM pixel (row,col) of the top-left corner of the grid
    pub fn origin(self, row: usize, col: usize) -> Self {
        Self {
            origin: (row, col),
            ..self
        }
    }
    /// Set the usable extent (rows,cols) of the SLM
    pub fn extent(self, rows: usize, cols: usize) -> Self {
        Self {
            extent: (rows, cols),
            ..self
        }
    }
    /// Set the usable extent to the largest square within the SLM `resolution` (rows,cols)
    pub fn square_extent(self, (rows, cols): (usize, usize)) -> Self {
        let n = rows.min(cols);
        self.extent(n, n)
    }
}

impl Builder for ApertureGridBuilder {
    type Component = ApertureGrid;

    fn build(self) -> crate::Result<Self::Component> {
        Ok(ApertureGrid::new(
            self.n_aperture,
            self.aperture_width,
            self.origin,
            self.extent,
        )?)
    }
}
