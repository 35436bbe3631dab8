//!
//! # Aperture grid
//!
//! The SLM is divided into a `n_aperture`x`n_aperture` grid of square apertures of `aperture_width` pixels.
//! The apertures are numbered in row-major order: the aperture at row `i` and column `j` of the grid
//! has the index `i*n_aperture+j`.
//! One of the apertures, the center aperture, is the reference of all the interferometric measurements.
//!
//! ```
//! use slm_wavefront::{Builder, FromBuilder, ApertureGrid, RoiWindow};
//! let grid = ApertureGrid::builder().n_aperture(8).aperture_width(64).build().unwrap();
//! assert_eq!(grid.center_index(), 35);
//! let roi = grid.select_roi(&RoiWindow::new(2, 2, 4)).unwrap();
//! assert_eq!(roi.len(), 16);
//! ```

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::FromBuilder;

mod builder;
pub use builder::ApertureGridBuilder;

#[derive(Debug, thiserror::Error)]
pub enum ApertureError {
    #[error("invalid aperture grid: {0}")]
    InvalidGrid(String),
    #[error(
        "ROI of size {size} at ({origin_row},{origin_col}) exceeds the {n_aperture}x{n_aperture} aperture grid"
    )]
    RoiOutOfBounds {
        origin_row: usize,
        origin_col: usize,
        size: usize,
        n_aperture: usize,
    },
    #[error("aperture #{0} is not in the grid of {1} apertures")]
    Index(usize, usize),
}

/// Index of the reference aperture in a `n`x`n` grid
///
/// The index is `n²/2 + n/2 - 1`, it is always within the grid for `n`≥2
pub fn center_index(n: usize) -> usize {
    (n * n / 2 + n / 2).saturating_sub(1)
}

/// A square aperture on the SLM
///
/// The bounds are in SLM pixels, `bottom` and `right` are excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aperture {
    /// Row-major index of the aperture in the grid
    pub index: usize,
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}
impl Aperture {
    /// Rows of the SLM covered by the aperture
    pub fn rows(&self) -> Range<usize> {
        self.top..self.bottom
    }
    /// Columns of the SLM covered by the aperture
    pub fn cols(&self) -> Range<usize> {
        self.left..self.right
    }
    pub fn width(&self) -> usize {
        self.right - self.left
    }
    pub fn height(&self) -> usize {
        self.bottom - self.top
    }
    /// Checks if the SLM pixel at (`row`,`col`) is inside the aperture
    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.rows().contains(&row) && self.cols().contains(&col)
    }
    /// Returns the (x,y) displacement in meters of the aperture with respect to the `center` aperture
    ///
    /// `x` is along the SLM columns and `y` along the SLM rows
    pub fn offset_from(&self, center: &Aperture, pitch: f64) -> (f64, f64) {
        let dx = (self.left as f64 - center.left as f64) * pitch;
        let dy = (self.top as f64 - center.top as f64) * pitch;
        (dx, dy)
    }
}

/// A square window of the aperture grid
///
/// The window starts at aperture (`origin_row`,`origin_col`) of the grid and is `size` apertures wide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiWindow {
    pub origin_row: usize,
    pub origin_col: usize,
    pub size: usize,
}
impl RoiWindow {
    pub fn new(origin_row: usize, origin_col: usize, size: usize) -> Self {
        Self {
            origin_row,
            origin_col,
            size,
        }
    }
    /// Number of apertures in the window
    pub fn len(&self) -> usize {
        self.size * self.size
    }
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}
impl Default for RoiWindow {
    fn default() -> Self {
        Self::new(2, 2, 4)
    }
}

/// Grid of apertures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApertureGrid {
    n_aperture: usize,
    aperture_width: usize,
    origin: (usize, usize),
    apertures: Vec<Aperture>,
}

impl FromBuilder for ApertureGrid {
    type ComponentBuilder = ApertureGridBuilder;
}

impl ApertureGrid {
    /// Computes the bounds of the apertures of a `n_aperture`x`n_aperture` grid
    ///
    /// The grid starts at the SLM pixel `origin` (row,col) and must fit within the usable
    /// `extent` (rows,cols) of the device
    pub fn new(
        n_aperture: usize,
        aperture_width: usize,
        origin: (usize, usize),
        extent: (usize, usize),
    ) -> Result<Self, ApertureError> {
        if n_aperture < 2 {
            return Err(ApertureError::InvalidGrid(format!(
                "at least 2x2 apertures are required, found {n_aperture}x{n_aperture}"
            )));
        }
        if aperture_width == 0 {
            return Err(ApertureError::InvalidGrid(
                "the aperture width must be at least 1 pixel".into(),
            ));
        }
        let size = n_aperture * aperture_width;
        if origin.0 + size > extent.0 || origin.1 + size > extent.1 {
            return Err(ApertureError::InvalidGrid(format!(
                "{n_aperture} apertures of {aperture_width}px from {origin:?} exceed the usable extent {extent:?}"
            )));
        }
        let apertures = (0..n_aperture)
            .flat_map(|i| (0..n_aperture).map(move |j| (i, j)))
            .map(|(i, j)| {
                let top = origin.0 + i * aperture_width;
                let left = origin.1 + j * aperture_width;
                Aperture {
                    index: i * n_aperture + j,
                    top,
                    bottom: top + aperture_width,
                    left,
                    right: left + aperture_width,
                }
            })
            .collect();
        log::debug!(
            "aperture grid: {n_aperture}x{n_aperture} apertures of {aperture_width}px from {origin:?}"
        );
        Ok(Self {
            n_aperture,
            aperture_width,
            origin,
            apertures,
        })
    }
    /// Number of apertures along one side of the grid
    pub fn n_aperture(&self) -> usize {
        self.n_aperture
    }
    pub fn aperture_width(&self) -> usize {
        self.aperture_width
    }
    /// Total number of apertures
    pub fn len(&self) -> usize {
        self.apertures.len()
    }
    pub fn is_empty(&self) -> bool {
        self.apertures.is_empty()
    }
    /// Returns the apertures in row-major order
    pub fn apertures(&self) -> &[Aperture] {
        &self.apertures
    }
    /// Returns the aperture at `index`
    pub fn get(&self, index: usize) -> Result<&Aperture, ApertureError> {
        self.apertures
            .get(index)
            .ok_or(ApertureError::Index(index, self.len()))
    }
    pub fn center_index(&self) -> usize {
        center_index(self.n_aperture)
    }
    /// Returns the reference aperture
    pub fn center(&self) -> &Aperture {
        &self.apertures[self.center_index()]
    }
    /// Returns the SLM pixel bounds (top, bottom, left, right) covered by the grid
    pub fn region(&self) -> (usize, usize, usize, usize) {
        let size = self.n_aperture * self.aperture_width;
        (
            self.origin.0,
            self.origin.0 + size,
            self.origin.1,
            self.origin.1 + size,
        )
    }
    /// Returns the indices of the apertures within the `roi` window, in row-major order
    pub fn select_roi(&self, roi: &RoiWindow) -> Result<Vec<usize>, ApertureError> {
        let n = self.n_aperture;
        if roi.is_empty() || roi.origin_row + roi.size > n || roi.origin_col + roi.size > n {
            return Err(ApertureError::RoiOutOfBounds {
                origin_row: roi.origin_row,
                origin_col: roi.origin_col,
                size: roi.size,
                n_aperture: n,
            });
        }
        Ok((roi.origin_row..roi.origin_row + roi.size)
            .flat_map(|i| (roi.origin_col..roi.origin_col + roi.size).map(move |j| i * n + j))
            .collect())
    }
}
