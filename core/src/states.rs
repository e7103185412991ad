//! State containers for the error-state Kalman filter.
//!
//! Three passive data records live here:
//!
//! - [`NominalState`]: the point estimate on the state manifold, integrated deterministically
//!   from corrected IMU measurements.
//! - [`ErrorStateGauss`]: the 15-dimensional Gaussian belief over the deviation between the
//!   true state and the nominal state.
//! - [`MultiVarGauss`]: a generic stamped multivariate Gaussian, used for predicted
//!   measurement distributions and for consistency metrics downstream.
//!
//! All three are replaced (not mutated) by every filter step; the filter hands ownership back
//! to the caller after each operation.

use crate::error::EskfError;
use crate::quaternion::RotationQuaternion;
use nalgebra::{Cholesky, SMatrix, SVector, Vector3};
use std::fmt::{self, Display};

/// Dimension of the error state: position, velocity, attitude, and two bias blocks.
pub const ERROR_STATE_DIM: usize = 15;

/// The nominal (point-estimate) state of the platform.
///
/// The state lives on the manifold R^3 x R^3 x SO(3) x R^3 x R^3: position, velocity,
/// orientation, accelerometer bias, and gyroscope bias, stamped with the time of the last
/// measurement that produced it. The nominal state never observes measurement noise directly;
/// it is a deterministic function of the previous state and the corrected IMU input, with
/// corrections entering only through error injection.
#[derive(Clone, Copy, Debug)]
pub struct NominalState {
    /// Position in meters, local frame
    pub pos: Vector3<f64>,
    /// Velocity in m/s, local frame
    pub vel: Vector3<f64>,
    /// Orientation of the body frame relative to the local frame
    pub ori: RotationQuaternion,
    /// Accelerometer bias in m/s^2, sensor frame
    pub accm_bias: Vector3<f64>,
    /// Gyroscope bias in rad/s, sensor frame
    pub gyro_bias: Vector3<f64>,
    /// Timestamp in seconds
    pub ts: f64,
}

impl NominalState {
    /// Create a nominal state from its components.
    pub fn new(
        pos: Vector3<f64>,
        vel: Vector3<f64>,
        ori: RotationQuaternion,
        accm_bias: Vector3<f64>,
        gyro_bias: Vector3<f64>,
        ts: f64,
    ) -> Self {
        NominalState {
            pos,
            vel,
            ori,
            accm_bias,
            gyro_bias,
            ts,
        }
    }

    /// An all-zero state (identity orientation) at the given timestamp.
    ///
    /// # Example
    /// ```rust
    /// use eskf::states::NominalState;
    /// let x0 = NominalState::zeros(0.0);
    /// assert_eq!(x0.pos.norm(), 0.0);
    /// assert_eq!(x0.ori.real(), 1.0);
    /// ```
    pub fn zeros(ts: f64) -> Self {
        NominalState {
            pos: Vector3::zeros(),
            vel: Vector3::zeros(),
            ori: RotationQuaternion::identity(),
            accm_bias: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            ts,
        }
    }
}

impl Display for NominalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let euler = self.ori.as_euler();
        write!(
            f,
            "NominalState {{ ts: {:.3}, pos: [{:.3}, {:.3}, {:.3}] m, vel: [{:.3}, {:.3}, {:.3}] m/s, rpy: [{:.2}, {:.2}, {:.2}] deg }}",
            self.ts,
            self.pos[0],
            self.pos[1],
            self.pos[2],
            self.vel[0],
            self.vel[1],
            self.vel[2],
            euler[0].to_degrees(),
            euler[1].to_degrees(),
            euler[2].to_degrees()
        )
    }
}

/// The Gaussian belief over the error state.
///
/// The 15-vector mean and 15×15 covariance are expressed in the local tangent space around
/// the current nominal state, ordered `[dpos, dvel, dtheta, daccm_bias, dgyro_bias]` where
/// `dtheta` is a rotation-vector attitude error. The covariance is symmetric positive
/// semi-definite at every observable point; the mean is exactly zero immediately after every
/// injection.
#[derive(Clone, Debug)]
pub struct ErrorStateGauss {
    /// Mean of the error state
    pub mean: SVector<f64, ERROR_STATE_DIM>,
    /// Covariance of the error state
    pub cov: SMatrix<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>,
    /// Timestamp in seconds
    pub ts: f64,
}

impl ErrorStateGauss {
    /// Create an error-state Gaussian.
    ///
    /// In debug builds an asymmetric covariance trips an assertion; release builds accept the
    /// value as-is and leave strict checking to [`ErrorStateGauss::check_invariants`].
    pub fn new(
        mean: SVector<f64, ERROR_STATE_DIM>,
        cov: SMatrix<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>,
        ts: f64,
    ) -> Self {
        debug_assert!(
            crate::linalg::is_symmetric(&cov, 1e-9),
            "error-state covariance must be symmetric"
        );
        ErrorStateGauss { mean, cov, ts }
    }

    /// A zero-mean Gaussian with a diagonal covariance built from per-block standard
    /// deviations `[pos, vel, angle, accm_bias, gyro_bias]`, each repeated over its
    /// three axes.
    ///
    /// # Example
    /// ```rust
    /// use eskf::states::ErrorStateGauss;
    /// let x_err = ErrorStateGauss::from_block_stds([1.0, 1.0, 0.1, 0.1, 0.001], 0.0);
    /// assert_eq!(x_err.cov[(0, 0)], 1.0);
    /// assert_eq!(x_err.cov[(14, 14)], 1e-6);
    /// ```
    pub fn from_block_stds(stds: [f64; 5], ts: f64) -> Self {
        let mut cov = SMatrix::<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>::zeros();
        for (block, std) in stds.iter().enumerate() {
            for axis in 0..3 {
                let i = 3 * block + axis;
                cov[(i, i)] = std * std;
            }
        }
        ErrorStateGauss {
            mean: SVector::zeros(),
            cov,
            ts,
        }
    }

    /// The position block of the mean.
    pub fn pos(&self) -> Vector3<f64> {
        self.mean.fixed_rows::<3>(0).into()
    }

    /// The velocity block of the mean.
    pub fn vel(&self) -> Vector3<f64> {
        self.mean.fixed_rows::<3>(3).into()
    }

    /// The attitude-error (rotation vector) block of the mean.
    pub fn avec(&self) -> Vector3<f64> {
        self.mean.fixed_rows::<3>(6).into()
    }

    /// The accelerometer-bias block of the mean.
    pub fn accm_bias(&self) -> Vector3<f64> {
        self.mean.fixed_rows::<3>(9).into()
    }

    /// The gyroscope-bias block of the mean.
    pub fn gyro_bias(&self) -> Vector3<f64> {
        self.mean.fixed_rows::<3>(12).into()
    }

    /// View the error state as a stamped multivariate Gaussian (for consistency metrics).
    pub fn as_gauss(&self) -> MultiVarGauss<ERROR_STATE_DIM> {
        MultiVarGauss::new(self.mean, self.cov, self.ts)
    }

    /// Strictly verify the covariance invariants: symmetry within `tol` and no eigenvalue
    /// below `-tol`.
    ///
    /// The filter itself only runs `debug_assert!`-level checks in its hot path; callers that
    /// want hard guarantees (e.g. long unattended runs configured strict) can call this after
    /// each update.
    ///
    /// # Errors
    /// * [`EskfError::InvariantViolation`] naming the failed property.
    pub fn check_invariants(&self, tol: f64) -> Result<(), EskfError> {
        if !crate::linalg::is_symmetric(&self.cov, tol) {
            return Err(EskfError::InvariantViolation(format!(
                "error covariance asymmetric beyond {tol} at t = {}",
                self.ts
            )));
        }
        let min_eig = crate::linalg::min_symmetric_eigenvalue(&self.cov);
        if min_eig < -tol {
            return Err(EskfError::InvariantViolation(format!(
                "error covariance has negative eigenvalue {min_eig} at t = {}",
                self.ts
            )));
        }
        Ok(())
    }
}

impl Display for ErrorStateGauss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ErrorStateGauss {{ ts: {:.3}, |mean|: {:.3e}, tr(cov): {:.3e} }}",
            self.ts,
            self.mean.norm(),
            self.cov.trace()
        )
    }
}

/// A stamped multivariate Gaussian of static dimension `N`.
///
/// Used for predicted measurement distributions ([`crate::filter::Eskf::predict_gnss_measurement`])
/// and as the common currency of the NIS/NEES consistency metrics in [`crate::sim`].
#[derive(Clone, Copy, Debug)]
pub struct MultiVarGauss<const N: usize> {
    /// Mean vector
    pub mean: SVector<f64, N>,
    /// Covariance matrix
    pub cov: SMatrix<f64, N, N>,
    /// Timestamp in seconds
    pub ts: f64,
}

impl<const N: usize> MultiVarGauss<N> {
    /// Create a stamped Gaussian from its mean, covariance, and timestamp.
    pub fn new(mean: SVector<f64, N>, cov: SMatrix<f64, N, N>, ts: f64) -> Self {
        MultiVarGauss { mean, cov, ts }
    }

    /// Squared Mahalanobis distance of `x` from this Gaussian:
    /// `(x - mean)^T cov^-1 (x - mean)`.
    ///
    /// # Returns
    /// * `Some(d2)` for a positive-definite covariance.
    /// * `None` when the covariance is singular (Cholesky factorization fails).
    pub fn mahalanobis_distance_sq(&self, x: &SVector<f64, N>) -> Option<f64> {
        let diff = x - self.mean;
        let chol = Cholesky::new(self.cov)?;
        Some(diff.dot(&chol.solve(&diff)))
    }

    /// Marginalize onto a subset of components.
    ///
    /// # Arguments
    /// * `indices` - The component indices to keep, e.g. `[0, 1]` for the planar block of a
    ///   position Gaussian.
    ///
    /// # Example
    /// ```rust
    /// use eskf::states::MultiVarGauss;
    /// use nalgebra::{SMatrix, SVector};
    /// let g = MultiVarGauss::new(
    ///     SVector::<f64, 3>::new(1.0, 2.0, 3.0),
    ///     SMatrix::<f64, 3, 3>::from_diagonal_element(2.0),
    ///     0.0,
    /// );
    /// let planar = g.marginal([0, 1]);
    /// assert_eq!(planar.mean[1], 2.0);
    /// assert_eq!(planar.cov[(1, 1)], 2.0);
    /// ```
    pub fn marginal<const M: usize>(&self, indices: [usize; M]) -> MultiVarGauss<M> {
        let mut mean = SVector::<f64, M>::zeros();
        let mut cov = SMatrix::<f64, M, M>::zeros();
        for (i, &bi) in indices.iter().enumerate() {
            mean[i] = self.mean[bi];
            for (j, &bj) in indices.iter().enumerate() {
                cov[(i, j)] = self.cov[(bi, bj)];
            }
        }
        MultiVarGauss { mean, cov, ts: self.ts }
    }
}
