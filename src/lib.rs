#![deny(dead_code)]
#![deny(unused_imports)]

//! Batched B-spline evaluation and fitting kernel.
//!
//! This crate is the numerical core of a learnable-spline model: it
//! evaluates B-spline bases over batches of independent 1-D grids, turns
//! basis coefficients into curve values, and recovers coefficients from
//! sampled curves by minimum-norm least squares. It owns no state and does
//! no I/O; every routine maps input views to freshly allocated arrays.

pub mod faer_ndarray;
pub mod lstsq;
pub mod spline;

pub use faer_ndarray::{FaerLinalgError, FaerQr, FaerSvd};
pub use lstsq::{LstsqDriver, lstsq_multi};
pub use spline::{
    SplineError, b_batch, coef2curve, curve2coef, curve2coef_with_driver, extend_grid,
};
