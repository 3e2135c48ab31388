//! Dense least-squares drivers for the coefficient solver.
//!
//! Each solve is `a · x ≈ b` with `a: (m, n)` and a block of right-hand
//! sides `b: (m, r)`. The contract, regardless of driver, is the
//! minimum-norm least-squares solution: on rank-deficient or
//! underdetermined systems the returned `x` is the minimizer with the
//! smallest Euclidean norm, matching LAPACK's `gelsd`/`gelsy` behavior.

use crate::faer_ndarray::{FaerLinalgError, FaerQr, FaerSvd};
use log::debug;
use ndarray::{Array2, ArrayView2, Axis, s};

/// Backend used to factorize the design matrix.
///
/// The choice is exposed to the caller rather than decided internally so the
/// embedding model can pick the factorization suited to its target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LstsqDriver {
    /// Thin-SVD pseudoinverse solve. Always minimum-norm; the robust
    /// default.
    #[default]
    Svd,
    /// Unpivoted QR with triangular back-substitution. Faster on
    /// well-conditioned full-rank systems; falls back to [`LstsqDriver::Svd`]
    /// when the factorization reveals rank deficiency, so the minimum-norm
    /// contract still holds.
    Qr,
}

/// Solves `a · x ≈ b` in the least-squares sense for a block of
/// right-hand-side columns, returning `x: (n, r)`.
pub fn lstsq_multi(
    a: ArrayView2<'_, f64>,
    b: ArrayView2<'_, f64>,
    driver: LstsqDriver,
) -> Result<Array2<f64>, FaerLinalgError> {
    debug_assert_eq!(
        a.nrows(),
        b.nrows(),
        "design and targets must agree on the equation count"
    );
    match driver {
        LstsqDriver::Svd => lstsq_svd(a, b),
        LstsqDriver::Qr => lstsq_qr(a, b),
    }
}

/// Relative cutoff separating numerical rank from roundoff, in the style of
/// LAPACK's default `rcond`: singular values (or `R` diagonal magnitudes)
/// at or below `max(m, n) · ε · largest` are treated as zero.
fn rank_cutoff(m: usize, n: usize, largest: f64) -> f64 {
    m.max(n) as f64 * f64::EPSILON * largest
}

fn lstsq_svd(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> Result<Array2<f64>, FaerLinalgError> {
    let (m, n) = a.dim();
    let (u, s, v) = a.thin_svd()?;

    let tol = rank_cutoff(m, n, s.first().copied().unwrap_or(0.0));
    let rank = s.iter().filter(|&&sv| sv > tol).count();
    if rank < m.min(n) {
        debug!(
            "least-squares design is rank deficient: rank {rank} of {} (m={m}, n={n})",
            m.min(n)
        );
    }

    // x = V · Σ⁺ · Uᵀ · b, dropping directions below the cutoff.
    let mut utb = u.t().dot(&b);
    for (i, mut row) in utb.axis_iter_mut(Axis(0)).enumerate() {
        let sv = s[i];
        if sv > tol {
            row.mapv_inplace(|x| x / sv);
        } else {
            row.fill(0.0);
        }
    }
    Ok(v.dot(&utb))
}

fn lstsq_qr(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> Result<Array2<f64>, FaerLinalgError> {
    let (m, n) = a.dim();
    if m < n {
        // Underdetermined: unpivoted QR of `a` cannot give the minimum-norm
        // minimizer.
        return lstsq_svd(a, b);
    }

    let (q, r) = a.qr()?;

    let diag_max = (0..n).map(|i| r[[i, i]].abs()).fold(0.0_f64, f64::max);
    let tol = rank_cutoff(m, n, diag_max);
    if diag_max == 0.0 || (0..n).any(|i| r[[i, i]].abs() <= tol) {
        debug!("QR driver detected a rank-deficient design, rerouting to SVD");
        return lstsq_svd(a, b);
    }

    // x solves R[..n, ..n] · x = (Qᵀ b)[..n, ..] by back-substitution.
    let qtb = q.t().dot(&b);
    let mut x = qtb.slice(s![..n, ..]).to_owned();
    for col in 0..x.ncols() {
        for i in (0..n).rev() {
            let mut acc = x[[i, col]];
            for j in i + 1..n {
                acc -= r[[i, j]] * x[[j, col]];
            }
            x[[i, col]] = acc / r[[i, i]];
        }
    }
    Ok(x)
}
