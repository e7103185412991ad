//! Linear algebra helpers for numerically robust covariance handling.
//!
//! Public API:
//!     pub fn symmetrize(matrix) -> matrix
//!     pub fn is_symmetric(matrix, tol) -> bool
//!     pub fn min_symmetric_eigenvalue(matrix) -> f64
//!     pub fn invert_spd(matrix) -> Option<matrix>
//!
//! Strategy for the SPD inverse:
//! 1) Symmetrize S ← 0.5 (S + Sᵀ)
//! 2) Cholesky inverse (fast path)
//! 3) Jittered Cholesky (geometric ramp on the diagonal)
//! 4) Give up and return None — the caller maps this to a singular-innovation error
//!
//! A covariance that survives thousands of sequential predict/update cycles only stays
//! symmetric positive semi-definite if round-off asymmetry is squashed at each step; these
//! helpers centralize that discipline.

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{Matrix3, SMatrix};

/// Diagonal jitter ramp used when a Cholesky factorization fails on a matrix that should be
/// SPD up to round-off. The ramp runs in decade steps from `INITIAL_JITTER` up to and
/// including `MAX_JITTER`.
const INITIAL_JITTER: f64 = 1e-12;
const MAX_JITTER: f64 = 1e-6;

/// Symmetrize a matrix: S ← 0.5 (S + Sᵀ)
///
/// Simple matrix symmetrization that removes the round-off asymmetry floating point
/// arithmetic accumulates in products like `A P Aᵀ`.
#[inline]
pub fn symmetrize<const D: usize>(m: &SMatrix<f64, D, D>) -> SMatrix<f64, D, D> {
    0.5 * (m + m.transpose())
}

/// Check whether a matrix is symmetric within an absolute tolerance.
pub fn is_symmetric<const D: usize>(m: &SMatrix<f64, D, D>, tol: f64) -> bool {
    for i in 0..D {
        for j in (i + 1)..D {
            if (m[(i, j)] - m[(j, i)]).abs() > tol {
                return false;
            }
        }
    }
    true
}

/// Smallest eigenvalue of a symmetric 15×15 matrix (the error-state covariance size).
///
/// Used by the strict invariant checks: a covariance is positive semi-definite exactly when
/// this is non-negative up to tolerance. The input is symmetrized first so that round-off
/// asymmetry does not perturb the eigendecomposition.
pub fn min_symmetric_eigenvalue(m: &SMatrix<f64, 15, 15>) -> f64 {
    let se = SymmetricEigen::new(symmetrize(m));
    se.eigenvalues.min()
}

/// Invert an SPD-ish 3×3 matrix (the innovation covariance) via Cholesky, with jitter
/// retries.
///
/// # Arguments
/// * `m` - The matrix to invert. Assumed symmetric positive definite up to round-off.
///
/// # Returns
/// * `Some(inverse)` when a (possibly jittered) Cholesky factorization succeeds.
/// * `None` when the matrix is singular beyond repair; the filter reports this as a
///   singular innovation covariance.
pub fn invert_spd(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    // 1) Symmetrize to kill round-off asymmetry
    let s = symmetrize(m);
    // 2) Cholesky (fast path)
    if let Some(ch) = Cholesky::new(s) {
        return Some(ch.inverse());
    }
    // 3) Jittered Cholesky
    let mut jitter = INITIAL_JITTER;
    while jitter <= MAX_JITTER {
        let mut sj = s;
        for i in 0..3 {
            sj[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(sj) {
            return Some(ch.inverse());
        }
        jitter *= 10.0;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_symmetrize() {
        let m = Matrix3::new(1.0, 2.0, 3.0, 0.0, 1.0, 4.0, 1.0, 0.0, 1.0);
        let s = symmetrize(&m);
        assert!(is_symmetric(&s, 0.0));
        assert_approx_eq!(s[(0, 1)], 1.0);
        assert_approx_eq!(s[(0, 2)], 2.0);
    }

    #[test]
    fn test_is_symmetric_tolerance() {
        let mut m = Matrix3::identity();
        m[(0, 1)] = 1e-12;
        assert!(is_symmetric(&m, 1e-9));
        assert!(!is_symmetric(&m, 1e-15));
    }

    #[test]
    fn test_min_symmetric_eigenvalue_identity() {
        let m = SMatrix::<f64, 15, 15>::identity();
        assert_approx_eq!(min_symmetric_eigenvalue(&m), 1.0);
    }

    #[test]
    fn test_min_symmetric_eigenvalue_indefinite() {
        let mut m = SMatrix::<f64, 15, 15>::identity();
        m[(7, 7)] = -2.0;
        assert_approx_eq!(min_symmetric_eigenvalue(&m), -2.0);
    }

    #[test]
    fn test_invert_spd_diagonal() {
        let m = Matrix3::from_diagonal(&nalgebra::Vector3::new(4.0, 2.0, 0.5));
        let inv = invert_spd(&m).unwrap();
        assert_approx_eq!(inv[(0, 0)], 0.25);
        assert_approx_eq!(inv[(1, 1)], 0.5);
        assert_approx_eq!(inv[(2, 2)], 2.0);
    }

    #[test]
    fn test_invert_spd_rejects_singular() {
        let m = Matrix3::new(
            1.0, 1.0, 0.0, //
            1.0, 1.0, 0.0, //
            0.0, 0.0, -1.0,
        );
        assert!(invert_spd(&m).is_none());
    }

    #[test]
    fn test_invert_spd_jitter_reaches_ceiling() {
        // An eigenvalue of -5e-7 is only repaired by the top decade of the jitter ramp.
        let m = Matrix3::from_diagonal(&nalgebra::Vector3::new(1.0, 1.0, -5e-7));
        let inv = invert_spd(&m).unwrap();
        assert!(inv[(2, 2)] > 0.0);
    }

    #[test]
    fn test_invert_spd_round_trip() {
        let m = Matrix3::new(
            2.0, 0.3, 0.1, //
            0.3, 1.5, 0.2, //
            0.1, 0.2, 1.0,
        );
        let inv = invert_spd(&m).unwrap();
        let eye = m * inv;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(eye[(i, j)], expected, 1e-10);
            }
        }
    }
}
