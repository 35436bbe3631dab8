//! Phase pattern helpers shared by the mask composer and the fringe fit

pub mod phase;

pub use phase::{centered_meshgrid, linear_grating, normalize, wrap};
