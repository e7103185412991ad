//! Error-state Kalman filter toolbox for IMU/GNSS fusion
//!
//! This crate implements an error-state Kalman filter (ESKF) that fuses high-rate inertial
//! measurements (accelerometer and gyroscope) with low-rate absolute position fixes (such as
//! GNSS) into a continuously updated estimate of position, velocity, orientation, and IMU
//! biases. The filter keeps two representations of the vehicle state side by side:
//!
//! - A **nominal state** ([`states::NominalState`]): the best point estimate on the state
//!   manifold $\mathbb{R}^3 \times \mathbb{R}^3 \times SO(3) \times \mathbb{R}^3 \times
//!   \mathbb{R}^3$, integrated deterministically from corrected IMU measurements using the
//!   strapdown equations.
//! - An **error state** ([`states::ErrorStateGauss`]): a 15-dimensional Gaussian belief over
//!   the deviation between the true state and the nominal state, expressed in the local
//!   tangent space with a rotation-vector attitude error:
//!
//! $$
//! \delta x = [\delta p (3), \\; \delta v (3), \\; \delta \theta (3), \\;
//! \delta b_a (3), \\; \delta b_\omega (3)]
//! $$
//!
//! The nonlinear part of the problem (quaternion orientation) lives entirely in the nominal
//! state, while the error state stays small and close to linear-Gaussian, which is what makes
//! the ESKF well behaved over long runs. On every IMU sample the nominal state is integrated
//! forward and the error-state covariance is propagated through the linearized error dynamics,
//! discretized exactly with the Van Loan method. On every position fix the error state receives
//! a standard Kalman correction (in the numerically robust Joseph form) and is then *injected*
//! into the nominal state and reset to zero mean.
//!
//! Primarily built off of one crate dependency:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): provides the statically sized linear
//!   algebra for the filters, including the matrix exponential used by the Van Loan
//!   discretization.
//!
//! The primary reference texts are _Quaternion kinematics for the error-state Kalman filter_
//! by Joan Solà and _Fundamentals of Sensor Fusion_ by Edmund Brekke. Variables are generally
//! named for the quantity they represent rather than the symbol used in the references; this
//! is relaxed inside short mathematical functions where the symbol is clearer.
//!
//! # Filter cycle
//!
//! ```text
//! raw IMU sample
//!    └─> correct_imu ──> predict_nominal   (nonlinear strapdown integration)
//!                    └─> predict_error_state (linear covariance propagation)
//! position fix
//!    └─> predict_gnss_measurement ──> update_error_state ──> inject
//! ```
//!
//! Every operation consumes the previous `(NominalState, ErrorStateGauss)` pair and returns
//! new values; nothing is mutated in place. The caller owns the state pair between calls and
//! is responsible for feeding measurements in non-decreasing timestamp order. A negative time
//! step is reported as [`error::EskfError::NonMonotonicTime`] and leaves the caller's pair
//! untouched.
//!
//! # Error-state dynamics
//!
//! The continuous-time error dynamics linearized about the nominal state are
//!
//! $$
//! \delta \dot{x} = A \\, \delta x + G \\, n
//! $$
//!
//! with the 15×15 transition matrix $A$ and the 15×12 noise mapping $G$ assembled in 3×3
//! blocks (see [`filter::Eskf::error_transition_matrix`] and
//! [`filter::Eskf::noise_injection_matrix`]). The pair $(A, G Q G^T)$ is discretized over each
//! IMU interval with the Van Loan construction: the matrix exponential of an augmented 30×30
//! matrix yields both the discrete transition matrix and the discrete process noise covariance
//! in one step. A second-order Taylor approximation of the exponential can be selected at
//! construction time for speed ([`filter::Discretization`]).

pub mod error;
pub mod filter;
pub mod linalg;
pub mod quaternion;
pub mod sim;
pub mod states;

pub use error::EskfError;

use nalgebra::{Matrix3, Vector3};
use std::fmt::{self, Display};

/// Reference gravity vector in the local frame (NED, z down), m/s^2.
///
/// The value 9.82 m/s^2 matches the mid-latitude gravity magnitude used when generating the
/// simulation scenarios; a different gravity vector can be configured per filter through
/// [`filter::EskfParams::gravity`].
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, 9.82);

/// Build the skew-symmetric (cross-product) matrix of a 3-vector.
///
/// For a vector $v = [a, b, c]$ the cross-product matrix is
///
/// $$
/// S(v) = \begin{bmatrix} 0 & -c & b \\\\ c & 0 & -a \\\\ -b & a & 0 \end{bmatrix}
/// $$
///
/// so that $S(v) u = v \times u$ for any vector $u$. The error-state transition matrix, the
/// GNSS lever-arm jacobian, and the injection reset jacobian are all assembled from these.
///
/// # Arguments
/// * `v` - The vector to build the cross-product matrix from.
///
/// # Returns
/// * The 3×3 skew-symmetric matrix of `v`.
///
/// # Example
/// ```rust
/// use eskf::cross_matrix;
/// use nalgebra::Vector3;
/// let a = Vector3::new(1.0, 2.0, 3.0);
/// let b = Vector3::new(-2.0, 0.5, 1.0);
/// assert_eq!(cross_matrix(&a) * b, a.cross(&b));
/// ```
pub fn cross_matrix(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v[2], v[1], //
        v[2], 0.0, -v[0], //
        -v[1], v[0], 0.0,
    )
}

/// Map a logical 3×3 block index pair to the (row, column) offset of that block.
///
/// The 15-dimensional error state is laid out in five 3-element blocks (position, velocity,
/// attitude, accelerometer bias, gyroscope bias). This helper translates a block coordinate
/// into the element offset used by `fixed_view`/`fixed_view_mut`, keeping the block structure
/// of the system matrices readable at the call site.
///
/// # Example
/// ```rust
/// use eskf::block_3x3;
/// use nalgebra::{Matrix3, SMatrix};
/// let mut a = SMatrix::<f64, 15, 15>::zeros();
/// let (row, col) = block_3x3(0, 1);
/// a.fixed_view_mut::<3, 3>(row, col).copy_from(&Matrix3::identity());
/// assert_eq!(a[(0, 3)], 1.0);
/// ```
pub const fn block_3x3(block_row: usize, block_col: usize) -> (usize, usize) {
    (3 * block_row, 3 * block_col)
}

/// A raw IMU sample: specific force and angular rate in the sensor frame.
///
/// The vectors are uncorrected sensor output; estimated biases and the fixed
/// misalignment/scale correction matrices are applied by
/// [`filter::Eskf::correct_imu`] before the sample enters the mechanization equations.
#[derive(Clone, Copy, Debug)]
pub struct ImuMeasurement {
    /// Specific force in m/s^2, sensor frame x, y, z axis
    pub acc: Vector3<f64>,
    /// Angular rate in rad/s, sensor frame x, y, z axis
    pub avel: Vector3<f64>,
    /// Sample timestamp in seconds
    pub ts: f64,
}

impl ImuMeasurement {
    /// Create a new IMU measurement from specific force and angular rate vectors.
    ///
    /// # Arguments
    /// * `acc` - Specific force in m/s^2 in the sensor frame x, y, z axis.
    /// * `avel` - Angular rate in rad/s in the sensor frame x, y, z axis.
    /// * `ts` - Sample timestamp in seconds.
    pub fn new(acc: Vector3<f64>, avel: Vector3<f64>, ts: f64) -> Self {
        ImuMeasurement { acc, avel, ts }
    }
}

impl Display for ImuMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImuMeasurement {{ ts: {:.3}, acc: [{:.4}, {:.4}, {:.4}], avel: [{:.4}, {:.4}, {:.4}] }}",
            self.ts, self.acc[0], self.acc[1], self.acc[2], self.avel[0], self.avel[1], self.avel[2]
        )
    }
}

/// An IMU sample after bias removal and misalignment/scale correction.
///
/// Same shape as [`ImuMeasurement`], kept as a distinct type so the nominal prediction and
/// error-state linearization cannot accidentally be fed raw sensor output.
#[derive(Clone, Copy, Debug)]
pub struct CorrectedImuMeasurement {
    /// Corrected specific force in m/s^2, body frame
    pub acc: Vector3<f64>,
    /// Corrected angular rate in rad/s, body frame
    pub avel: Vector3<f64>,
    /// Sample timestamp in seconds (passed through from the raw sample)
    pub ts: f64,
}

impl Display for CorrectedImuMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CorrectedImuMeasurement {{ ts: {:.3}, acc: [{:.4}, {:.4}, {:.4}], avel: [{:.4}, {:.4}, {:.4}] }}",
            self.ts, self.acc[0], self.acc[1], self.acc[2], self.avel[0], self.avel[1], self.avel[2]
        )
    }
}

/// An absolute position fix (GNSS) in the local frame.
#[derive(Clone, Copy, Debug)]
pub struct GnssMeasurement {
    /// Antenna position in meters, local frame
    pub pos: Vector3<f64>,
    /// Fix timestamp in seconds
    pub ts: f64,
    /// Receiver-reported accuracy figure in meters, if available.
    ///
    /// Only used when the filter is configured with
    /// [`filter::EskfParams::use_gnss_accuracy`], in which case the fixed measurement
    /// covariance is scaled by `(accuracy / 3)^2`.
    pub accuracy: Option<f64>,
}

impl GnssMeasurement {
    /// Create a new position fix without an accuracy figure.
    pub fn new(pos: Vector3<f64>, ts: f64) -> Self {
        GnssMeasurement {
            pos,
            ts,
            accuracy: None,
        }
    }

    /// Create a new position fix with a receiver-reported accuracy figure in meters.
    pub fn with_accuracy(pos: Vector3<f64>, ts: f64, accuracy: f64) -> Self {
        GnssMeasurement {
            pos,
            ts,
            accuracy: Some(accuracy),
        }
    }
}

impl Display for GnssMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.accuracy {
            Some(acc) => write!(
                f,
                "GnssMeasurement {{ ts: {:.3}, pos: [{:.3}, {:.3}, {:.3}], accuracy: {:.2} }}",
                self.ts, self.pos[0], self.pos[1], self.pos[2], acc
            ),
            None => write!(
                f,
                "GnssMeasurement {{ ts: {:.3}, pos: [{:.3}, {:.3}, {:.3}] }}",
                self.ts, self.pos[0], self.pos[1], self.pos[2]
            ),
        }
    }
}
