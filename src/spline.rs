//! Batched 1-D B-spline evaluation and fitting.
//!
//! Every routine is a pure function over batches of independent spline
//! problems: a `(S, G)` grid block holds `S` knot vectors, a `(S, N)` sample
//! block holds `N` evaluation points per spline, and basis tensors are
//! `(S, C, N)` with `C = G − k − 1` basis functions for order `k`. Grid
//! extension is the caller's job ([`extend_grid`]); the evaluator never pads
//! internally.
//!
//! Degenerate grids (repeated knots) are tolerated everywhere: any
//! non-finite value produced by a zero-width knot interval is replaced with
//! exactly zero after each recursion level, so degenerate basis functions
//! contribute nothing instead of poisoning downstream sums.

use crate::faer_ndarray::FaerLinalgError;
use crate::lstsq::{LstsqDriver, lstsq_multi};
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut2, Axis, s};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::OnceLock;
use thiserror::Error;

/// Batch-entry count above which the coefficient solver fans out across the
/// crate thread pool. Entries are independent, so this is purely a
/// performance switch.
const PAR_THRESHOLD: usize = 32;

fn solver_thread_pool() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();
    POOL.get_or_init(|| {
        ThreadPoolBuilder::new()
            .build()
            .expect("spline solver thread pool initialization should succeed")
    })
}

/// Errors for the batched spline routines.
///
/// Shape violations fail fast at the point of mismatch. Numerical
/// degeneracy inside the basis recursion is never an error (it is absorbed
/// as zeros); only a failing least-squares backend surfaces as
/// [`SplineError::Linalg`], and only from the coefficient solver.
#[derive(Error, Debug)]
pub enum SplineError {
    #[error("Batch axes disagree: expected {expected} splines, found {found}.")]
    BatchSizeMismatch { expected: usize, found: usize },

    #[error("Sample axes disagree: expected {expected} samples, found {found}.")]
    SampleCountMismatch { expected: usize, found: usize },

    #[error(
        "Coefficient axis has {found} entries but the grid and order imply {expected} basis functions."
    )]
    CoefficientCountMismatch { expected: usize, found: usize },

    #[error(
        "Insufficient knots for order {order}: need at least {required} grid points but only {provided} were provided."
    )]
    InsufficientKnots {
        order: usize,
        required: usize,
        provided: usize,
    },

    #[error("Least-squares backend failed: {0}")]
    Linalg(#[from] FaerLinalgError),
}

/// Pads each grid row symmetrically with `k_extend` knots on both ends.
///
/// The step is `h = (last − first) / (G − 1)`, computed once per row from
/// the original endpoints and reused for every added knot, so extension by
/// `a` then `b` equals extension by `a + b`. This assumes near-uniform
/// spacing; non-uniform grids are padded with the same averaged step (a
/// known limitation of the scheme, kept deliberately). A single-point grid
/// divides by zero and propagates the non-finite step into the padding.
pub fn extend_grid(grid: ArrayView2<'_, f64>, k_extend: usize) -> Array2<f64> {
    let (num_splines, g) = grid.dim();
    let mut extended = Array2::<f64>::zeros((num_splines, g + 2 * k_extend));

    for (row, mut out) in grid.outer_iter().zip(extended.outer_iter_mut()) {
        let first = row[0];
        let last = row[g - 1];
        let h = (last - first) / (g as f64 - 1.0);

        for i in 1..=k_extend {
            out[k_extend - i] = first - i as f64 * h;
            out[g - 1 + k_extend + i] = last + i as f64 * h;
        }
        out.slice_mut(s![k_extend..k_extend + g]).assign(&row);
    }

    extended
}

/// Evaluates the order-`k` B-spline basis for every spline in the batch.
///
/// `x` is `(S, N)`, `grid` is `(S, G)` with knots non-decreasing along each
/// row; the result is `(S, C, N)` with `C = G − k − 1`. The Cox–de Boor
/// recursion is built bottom-up from the order-0 indicator bases on the same
/// grid:
///
/// - order 0: `B_i(x) = 1` iff `grid[i] ≤ x < grid[i+1]` (half-open on the
///   right, so a sample equal to the last knot activates nothing);
/// - order k: `B_{i,k} = (x − t_i)/(t_{i+k} − t_i) · B_{i,k-1}
///   + (t_{i+k+1} − x)/(t_{i+k+1} − t_{i+1}) · B_{i+1,k-1}`.
///
/// Zero-width knot intervals make a term non-finite; those entries are
/// zeroed at the level where they arise.
pub fn b_batch(
    x: ArrayView2<'_, f64>,
    grid: ArrayView2<'_, f64>,
    k: usize,
) -> Result<Array3<f64>, SplineError> {
    let (sx, _) = x.dim();
    let (sg, g) = grid.dim();
    if sx != sg {
        return Err(SplineError::BatchSizeMismatch {
            expected: sg,
            found: sx,
        });
    }
    if g < k + 2 {
        return Err(SplineError::InsufficientKnots {
            order: k,
            required: k + 2,
            provided: g,
        });
    }
    Ok(b_batch_recurse(x, grid, k))
}

fn b_batch_recurse(x: ArrayView2<'_, f64>, grid: ArrayView2<'_, f64>, k: usize) -> Array3<f64> {
    let (num_splines, num_samples) = x.dim();
    let g = grid.ncols();

    if k == 0 {
        let mut value = Array3::<f64>::zeros((num_splines, g - 1, num_samples));
        for si in 0..num_splines {
            for i in 0..g - 1 {
                let lo = grid[[si, i]];
                let hi = grid[[si, i + 1]];
                for ni in 0..num_samples {
                    let xv = x[[si, ni]];
                    if xv >= lo && xv < hi {
                        value[[si, i, ni]] = 1.0;
                    }
                }
            }
        }
        return value;
    }

    let lower = b_batch_recurse(x, grid, k - 1);
    let num_bases = g - k - 1;
    let mut value = Array3::<f64>::zeros((num_splines, num_bases, num_samples));

    for si in 0..num_splines {
        for i in 0..num_bases {
            let t_i = grid[[si, i]];
            let t_i1 = grid[[si, i + 1]];
            let t_ik = grid[[si, i + k]];
            let t_ik1 = grid[[si, i + k + 1]];
            let left_width = t_ik - t_i;
            let right_width = t_ik1 - t_i1;

            for ni in 0..num_samples {
                let xv = x[[si, ni]];
                let blended = (xv - t_i) / left_width * lower[[si, i, ni]]
                    + (t_ik1 - xv) / right_width * lower[[si, i + 1, ni]];
                // Zero-width intervals yield NaN/inf here; suppress at this
                // level so later levels multiply against clean zeros.
                if blended.is_finite() {
                    value[[si, i, ni]] = blended;
                }
            }
        }
    }

    value
}

/// Evaluates spline curves from basis coefficients.
///
/// `coef` is `(S, out_dim, C)`; the result is `(S, out_dim, N)` with
/// `y[s, o, n] = Σ_c basis[s, c, n] · coef[s, o, c]`, computed as one
/// matrix product per batch entry.
pub fn coef2curve(
    x_eval: ArrayView2<'_, f64>,
    grid: ArrayView2<'_, f64>,
    coef: ArrayView3<'_, f64>,
    k: usize,
) -> Result<Array3<f64>, SplineError> {
    let (num_splines, num_samples) = x_eval.dim();
    let (coef_splines, out_dim, coef_count) = coef.dim();
    if coef_splines != num_splines {
        return Err(SplineError::BatchSizeMismatch {
            expected: num_splines,
            found: coef_splines,
        });
    }

    let basis = b_batch(x_eval, grid, k)?;
    let num_bases = basis.dim().1;
    if coef_count != num_bases {
        return Err(SplineError::CoefficientCountMismatch {
            expected: num_bases,
            found: coef_count,
        });
    }

    let mut y_eval = Array3::<f64>::zeros((num_splines, out_dim, num_samples));
    for si in 0..num_splines {
        let basis_s = basis.index_axis(Axis(0), si);
        let coef_s = coef.index_axis(Axis(0), si);
        y_eval
            .index_axis_mut(Axis(0), si)
            .assign(&coef_s.dot(&basis_s));
    }
    Ok(y_eval)
}

/// Recovers basis coefficients from sampled curve values by batched least
/// squares, using the default (SVD, minimum-norm) driver.
///
/// `x_eval` is `(in_dim, N)`, `y_eval` is sample-major
/// `(N, in_dim, out_dim)`, `grid` is `(in_dim, G)`; the result is
/// `(in_dim, out_dim, C)` with `C = G − k − 1`.
pub fn curve2coef(
    x_eval: ArrayView2<'_, f64>,
    y_eval: ArrayView3<'_, f64>,
    grid: ArrayView2<'_, f64>,
    k: usize,
) -> Result<Array3<f64>, SplineError> {
    curve2coef_with_driver(x_eval, y_eval, grid, k, LstsqDriver::default())
}

/// [`curve2coef`] with an explicit least-squares driver.
///
/// Each input spline contributes one `(N, C)` design matrix shared by all of
/// its output channels, so the solver factorizes once per spline and solves
/// `out_dim` right-hand sides against it. The `in_dim` solves are
/// independent and run on the crate thread pool for large batches.
/// Underdetermined (`N < C`) and rank-deficient systems return the
/// minimum-norm solution rather than erroring.
pub fn curve2coef_with_driver(
    x_eval: ArrayView2<'_, f64>,
    y_eval: ArrayView3<'_, f64>,
    grid: ArrayView2<'_, f64>,
    k: usize,
    driver: LstsqDriver,
) -> Result<Array3<f64>, SplineError> {
    let (in_dim, num_samples) = x_eval.dim();
    let (y_samples, y_in_dim, out_dim) = y_eval.dim();
    if y_in_dim != in_dim {
        return Err(SplineError::BatchSizeMismatch {
            expected: in_dim,
            found: y_in_dim,
        });
    }
    if y_samples != num_samples {
        return Err(SplineError::SampleCountMismatch {
            expected: num_samples,
            found: y_samples,
        });
    }

    let basis = b_batch(x_eval, grid, k)?;
    let num_bases = basis.dim().1;
    let mut coef = Array3::<f64>::zeros((in_dim, out_dim, num_bases));

    let solve_one = |i: usize, mut out: ArrayViewMut2<'_, f64>| -> Result<(), SplineError> {
        // Basis rows are (C, N); the design matrix is the (N, C) transpose.
        let design = basis.index_axis(Axis(0), i);
        let targets = y_eval.index_axis(Axis(1), i);
        let solution = lstsq_multi(design.t(), targets, driver)?;
        out.assign(&solution.t());
        Ok(())
    };

    if in_dim >= PAR_THRESHOLD {
        solver_thread_pool().install(|| {
            coef.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .try_for_each(|(i, out)| solve_one(i, out))
        })?;
    } else {
        for (i, out) in coef.axis_iter_mut(Axis(0)).enumerate() {
            solve_one(i, out)?;
        }
    }

    Ok(coef)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, array};

    #[test]
    fn extend_grid_pads_uniform_grid_with_uniform_step() {
        let grid = array![[0.0, 1.0, 2.0, 3.0, 4.0]];
        let extended = extend_grid(grid.view(), 2);
        let expected = array![[-2.0, -1.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]];
        assert_eq!(extended.dim(), (1, 9));
        for (got, want) in extended.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn extend_grid_twice_by_one_equals_once_by_two() {
        let grid = array![[0.0, 0.5, 1.0, 1.5, 2.0], [-1.0, 0.0, 1.0, 2.0, 3.0]];
        let twice = extend_grid(extend_grid(grid.view(), 1).view(), 1);
        let once = extend_grid(grid.view(), 2);
        assert_eq!(twice.dim(), once.dim());
        for (got, want) in twice.iter().zip(once.iter()) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn extend_grid_uses_averaged_step_for_nonuniform_rows() {
        // Endpoints 0 and 3 over 4 points give h = 1 regardless of the
        // interior spacing.
        let grid = array![[0.0, 0.1, 0.2, 3.0]];
        let extended = extend_grid(grid.view(), 1);
        assert_abs_diff_eq!(extended[[0, 0]], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(extended[[0, 5]], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn extend_grid_single_point_propagates_nonfinite_step() {
        let grid = array![[1.0]];
        let extended = extend_grid(grid.view(), 1);
        assert!(!extended[[0, 0]].is_finite());
        assert!(!extended[[0, 2]].is_finite());
        assert_abs_diff_eq!(extended[[0, 1]], 1.0, epsilon = 0.0);
    }

    #[test]
    fn order_zero_bases_are_exclusive_indicators() {
        let grid = array![[0.0, 1.0, 2.0, 3.0]];
        let x = array![[0.5, 1.0, 2.9]];
        let basis = b_batch(x.view(), grid.view(), 0).expect("b_batch should succeed");
        assert_eq!(basis.dim(), (1, 3, 3));

        // Each interior sample activates exactly one indicator.
        for ni in 0..3 {
            let active: f64 = (0..3).map(|i| basis[[0, i, ni]]).sum();
            assert_abs_diff_eq!(active, 1.0, epsilon = 0.0);
        }
        // x = 0.5 lands in [0, 1); x = 1.0 in [1, 2) by the half-open rule.
        assert_eq!(basis[[0, 0, 0]], 1.0);
        assert_eq!(basis[[0, 1, 1]], 1.0);
        assert_eq!(basis[[0, 2, 2]], 1.0);
    }

    #[test]
    fn order_zero_two_point_grid_is_single_indicator() {
        let grid = array![[0.0, 1.0]];
        let x = array![[0.0, 0.5, 1.0]];
        let basis = b_batch(x.view(), grid.view(), 0).expect("b_batch should succeed");
        assert_eq!(basis.dim(), (1, 1, 3));
        assert_eq!(basis[[0, 0, 0]], 1.0);
        assert_eq!(basis[[0, 0, 1]], 1.0);
        // The rightmost boundary is exclusive.
        assert_eq!(basis[[0, 0, 2]], 0.0);
    }

    #[test]
    fn cubic_basis_on_extended_grid_sums_to_one() {
        let grid = array![[0.0, 1.0, 2.0, 3.0, 4.0]];
        let extended = extend_grid(grid.view(), 3);
        assert_eq!(extended.ncols(), 11);

        let x = array![[2.5]];
        let basis = b_batch(x.view(), extended.view(), 3).expect("b_batch should succeed");
        assert_eq!(basis.dim(), (1, 7, 1));

        let total: f64 = basis.slice(s![0, .., 0]).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn degenerate_grid_produces_zeros_not_nan() {
        // Repeated interior knot: zero-width interval.
        let grid = array![[0.0, 1.0, 1.0, 2.0, 3.0, 4.0]];
        let x = array![[0.5, 1.0, 2.5]];
        for k in 0..=2 {
            let basis = b_batch(x.view(), grid.view(), k).expect("b_batch should succeed");
            assert!(
                basis.iter().all(|v| v.is_finite()),
                "order {k} produced non-finite entries"
            );
        }
    }

    #[test]
    fn b_batch_rejects_batch_mismatch() {
        let grid = array![[0.0, 1.0, 2.0], [0.0, 1.0, 2.0]];
        let x = array![[0.5]];
        assert!(matches!(
            b_batch(x.view(), grid.view(), 0),
            Err(SplineError::BatchSizeMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn b_batch_rejects_insufficient_knots() {
        let grid = array![[0.0, 1.0, 2.0]];
        let x = array![[0.5]];
        assert!(matches!(
            b_batch(x.view(), grid.view(), 2),
            Err(SplineError::InsufficientKnots {
                order: 2,
                required: 4,
                provided: 3
            })
        ));
    }

    #[test]
    fn coef2curve_matches_manual_contraction() {
        let grid = array![[0.0, 1.0, 2.0, 3.0, 4.0]];
        let x = array![[0.5, 1.5, 3.2]];
        let k = 1;
        // C = 5 - 1 - 1 = 3 bases, two output channels.
        let coef = array![[[1.0, -2.0, 0.5], [0.0, 1.0, 1.0]]];

        let y = coef2curve(x.view(), grid.view(), coef.view(), k).expect("coef2curve");
        assert_eq!(y.dim(), (1, 2, 3));

        let basis = b_batch(x.view(), grid.view(), k).expect("b_batch");
        for o in 0..2 {
            for ni in 0..3 {
                let manual: f64 = (0..3).map(|c| basis[[0, c, ni]] * coef[[0, o, c]]).sum();
                assert_abs_diff_eq!(y[[0, o, ni]], manual, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn coef2curve_rejects_wrong_coefficient_count() {
        let grid = array![[0.0, 1.0, 2.0, 3.0, 4.0]];
        let x = array![[0.5]];
        let coef = Array3::<f64>::zeros((1, 1, 5));
        assert!(matches!(
            coef2curve(x.view(), grid.view(), coef.view(), 1),
            Err(SplineError::CoefficientCountMismatch {
                expected: 3,
                found: 5
            })
        ));
    }

    #[test]
    fn curve2coef_rejects_sample_mismatch() {
        let grid = array![[0.0, 1.0, 2.0, 3.0, 4.0]];
        let x = array![[0.5, 1.5]];
        let y = Array3::<f64>::zeros((3, 1, 1));
        assert!(matches!(
            curve2coef(x.view(), y.view(), grid.view(), 1),
            Err(SplineError::SampleCountMismatch {
                expected: 2,
                found: 3
            })
        ));
    }

    #[test]
    fn curve2coef_rejects_batch_mismatch() {
        let grid = array![[0.0, 1.0, 2.0, 3.0, 4.0]];
        let x = array![[0.5, 1.5]];
        let y = Array3::<f64>::zeros((2, 2, 1));
        assert!(matches!(
            curve2coef(x.view(), y.view(), grid.view(), 1),
            Err(SplineError::BatchSizeMismatch {
                expected: 1,
                found: 2
            })
        ));
    }
}
