//! The error-state Kalman filter.
//!
//! This module contains the filter configuration ([`EskfParams`]), the discretization policy
//! ([`Discretization`]), and the filter itself ([`Eskf`]). The filter owns no mutable state:
//! every operation is a total function of the static configuration, the previous
//! `(NominalState, ErrorStateGauss)` pair, and the current measurement, and returns new state
//! values. Callers drive the cycle
//!
//! ```text
//! INIT -> (predict_from_imu)* -> update_from_gnss -> (predict_from_imu)* -> ...
//! ```
//!
//! # Mathematical background
//!
//! ## Prediction
//!
//! The nominal state integrates the strapdown equations with a corrected IMU sample over
//! `dt`:
//!
//! $$
//! \begin{aligned}
//! a &= R(q) \\, f_{imu} + g \\\\
//! v(+) &= v(-) + a \\, dt \\\\
//! p(+) &= p(-) + v(-) \\, dt + \tfrac{1}{2} a \\, dt^2 \\\\
//! q(+) &= q(-) \otimes q\\{ \omega \\, dt \\} \\\\
//! b(+) &= b(-) \\, e^{-p \\, dt}
//! \end{aligned}
//! $$
//!
//! while the error-state covariance propagates through the discretized linear error dynamics:
//!
//! $$
//! \delta x(+) = A_d \\, \delta x(-), \qquad
//! P(+) = A_d P(-) A_d^T + (GQG^T)_d
//! $$
//!
//! The discrete pair $(A_d, (GQG^T)_d)$ comes from the Van Loan construction: with
//! $M = dt \begin{bmatrix} -A & GQG^T \\\\ 0 & A^T \end{bmatrix}$ and $e^M$ partitioned into
//! 15×15 blocks, $A_d$ is the transpose of the bottom-right block and $(GQG^T)_d = A_d$ times
//! the top-right block.
//!
//! ## Update and injection
//!
//! A position fix updates the error-state Gaussian with a standard Kalman correction using
//! the Joseph-form covariance
//!
//! $$
//! P(+) = (I - WH) P (I - WH)^T + W R W^T
//! $$
//!
//! which preserves symmetry and positive semi-definiteness under floating-point error better
//! than the short form $(I - WH)P$. The corrected error mean is then *injected* into the
//! nominal state (positions, velocities, and biases add; the attitude error composes as a
//! small-angle quaternion), the error mean is reset to exactly zero, and the covariance gets
//! the matching reset-jacobian correction $P \leftarrow G P G^T$.

use crate::error::EskfError;
use crate::quaternion::RotationQuaternion;
use crate::states::{ERROR_STATE_DIM, ErrorStateGauss, MultiVarGauss, NominalState};
use crate::{CorrectedImuMeasurement, GnssMeasurement, GRAVITY, ImuMeasurement, block_3x3, cross_matrix, linalg};

use nalgebra::{Matrix3, SMatrix, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Dimension of the white-noise input driving the error dynamics
/// (accelerometer, gyroscope, and the two bias random walks).
const NOISE_DIM: usize = 12;

/// How the continuous error dynamics are discretized over each IMU interval.
///
/// The choice is a filter-level policy fixed at construction, not a per-call parameter. The
/// exact mode is the reference for correctness testing; the Taylor mode trades accuracy for
/// speed and stays close to exact for small `dt` (they agree to about 1e-3 relative at
/// `dt = 0.01 s` and diverge as `dt` grows).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Discretization {
    /// Exact matrix exponential of the 30×30 Van Loan matrix.
    #[default]
    Exact,
    /// Second-order Taylor expansion `I + M + M²/2` of the exponential.
    TaylorSecondOrder,
}

/// Static filter configuration, fixed at construction.
///
/// Serializable so tuning presets can live in JSON or TOML files next to the data they were
/// tuned for; see [`EskfParams::from_file`]. Missing fields fall back to the defaults, which
/// correspond to a mid-grade MEMS IMU simulation preset.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EskfParams {
    /// Accelerometer white-noise standard deviation, m/s^2
    pub accm_std: f64,
    /// Accelerometer bias random-walk standard deviation, m/s^2
    pub accm_bias_std: f64,
    /// Accelerometer bias decay rate (inverse time constant), 1/s
    pub accm_bias_p: f64,

    /// Gyroscope white-noise standard deviation, rad/s
    pub gyro_std: f64,
    /// Gyroscope bias random-walk standard deviation, rad/s
    pub gyro_bias_std: f64,
    /// Gyroscope bias decay rate (inverse time constant), 1/s
    pub gyro_bias_p: f64,

    /// GNSS position noise standard deviation, horizontal (north/east), m
    pub gnss_std_ne: f64,
    /// GNSS position noise standard deviation, vertical (down), m
    pub gnss_std_d: f64,

    /// Fixed accelerometer misalignment/scale correction matrix
    pub accm_correction: Matrix3<f64>,
    /// Fixed gyroscope misalignment/scale correction matrix
    pub gyro_correction: Matrix3<f64>,
    /// Antenna lever arm: position of the GNSS antenna in the body frame, m
    pub lever_arm: Vector3<f64>,
    /// Gravity vector in the local frame, m/s^2
    pub gravity: Vector3<f64>,

    /// Discretization policy for the error dynamics
    pub discretization: Discretization,
    /// Scale the GNSS covariance by `(accuracy / 3)^2` when a fix reports an accuracy figure
    pub use_gnss_accuracy: bool,

    /// Initial nominal position, m
    pub init_pos: Vector3<f64>,
    /// Initial nominal velocity, m/s
    pub init_vel: Vector3<f64>,
    /// Initial nominal attitude as roll/pitch/yaw, rad
    pub init_euler: Vector3<f64>,

    /// Initial error standard deviation, position, m
    pub init_pos_std: f64,
    /// Initial error standard deviation, velocity, m/s
    pub init_vel_std: f64,
    /// Initial error standard deviation, attitude angle, rad
    pub init_angle_std: f64,
    /// Initial error standard deviation, accelerometer bias, m/s^2
    pub init_accm_bias_std: f64,
    /// Initial error standard deviation, gyroscope bias, rad/s
    pub init_gyro_bias_std: f64,
}

impl Default for EskfParams {
    fn default() -> Self {
        EskfParams {
            // Velocity random walk: 0.7 m/s/sqrt(hr) class sensor, scaled up 10x
            accm_std: 10.0 * 0.07 / 60.0,
            accm_bias_std: 500.0 * 0.007 * 9.81 / 1000.0,
            accm_bias_p: 0.01 * 1.89 / 150.0,
            // Angle random walk: 0.15 deg/sqrt(hr) class sensor, scaled up 1000x
            gyro_std: 1000.0 * 0.15 * std::f64::consts::PI / (180.0 * 60.0),
            gyro_bias_std: 100.0 * (0.09 * std::f64::consts::PI / (180.0 * 3600.0)).sqrt(),
            gyro_bias_p: 0.1 * 1.89 / 800.0,
            gnss_std_ne: 0.5,
            gnss_std_d: 2.0,
            accm_correction: Matrix3::identity(),
            gyro_correction: Matrix3::identity(),
            lever_arm: Vector3::zeros(),
            gravity: GRAVITY,
            discretization: Discretization::Exact,
            use_gnss_accuracy: false,
            init_pos: Vector3::zeros(),
            init_vel: Vector3::zeros(),
            init_euler: Vector3::zeros(),
            init_pos_std: 1.0,
            init_vel_std: 1.0,
            init_angle_std: 0.1_f64.to_radians(),
            init_accm_bias_std: 0.1,
            init_gyro_bias_std: 0.001,
        }
    }
}

impl EskfParams {
    /// Build the initial nominal state from the configured position, velocity, and attitude,
    /// with zero bias estimates.
    pub fn initial_nominal_state(&self, ts: f64) -> NominalState {
        NominalState {
            pos: self.init_pos,
            vel: self.init_vel,
            ori: RotationQuaternion::from_euler(self.init_euler),
            ..NominalState::zeros(ts)
        }
    }

    /// Build the initial error-state Gaussian from the configured per-block standard
    /// deviations: zero mean, block-diagonal covariance.
    pub fn initial_error_state(&self, ts: f64) -> ErrorStateGauss {
        ErrorStateGauss::from_block_stds(
            [
                self.init_pos_std,
                self.init_vel_std,
                self.init_angle_std,
                self.init_accm_bias_std,
                self.init_gyro_bias_std,
            ],
            ts,
        )
    }

    /// Write the parameters to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the parameters from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    /// Write the parameters as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the parameters from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Generic write: choose format by file extension (.json/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }

    /// Generic read: choose format by file extension (.json/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension_of(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// The error-state Kalman filter.
///
/// Holds the validated configuration plus two quantities precomputed at construction: the
/// continuous process-noise covariance `Q` (12×12, block diagonal over the four noise
/// channels) and the fixed GNSS measurement covariance. All filter operations take the
/// previous state pair by value and produce new values; see the module docs for the cycle.
///
/// # Example
/// ```rust
/// use eskf::filter::{Eskf, EskfParams};
/// use eskf::states::NominalState;
/// use eskf::ImuMeasurement;
/// use nalgebra::Vector3;
///
/// let params = EskfParams::default();
/// let eskf = Eskf::new(params.clone()).unwrap();
/// let x_nom = NominalState::zeros(0.0);
/// let x_err = params.initial_error_state(0.0);
/// // A stationary sample: specific force cancels gravity, no rotation.
/// let z_imu = ImuMeasurement::new(Vector3::new(0.0, 0.0, -9.82), Vector3::zeros(), 0.01);
/// let (x_nom, x_err) = eskf.predict_from_imu(x_nom, x_err, &z_imu).unwrap();
/// assert!(x_nom.pos.norm() < 1e-9);
/// assert!(x_err.cov.trace() > 0.0);
/// ```
#[derive(Clone, Debug)]
pub struct Eskf {
    params: EskfParams,
    /// Continuous process-noise covariance of the 12-dim white-noise input
    q_err: SMatrix<f64, NOISE_DIM, NOISE_DIM>,
    /// Fixed GNSS position covariance, diag(ne^2, ne^2, d^2)
    gnss_cov: Matrix3<f64>,
}

impl Display for Eskf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eskf")
            .field("accm_std", &self.params.accm_std)
            .field("gyro_std", &self.params.gyro_std)
            .field("gnss_std_ne", &self.params.gnss_std_ne)
            .field("gnss_std_d", &self.params.gnss_std_d)
            .field("discretization", &self.params.discretization)
            .finish()
    }
}

impl Eskf {
    /// Validate the configuration and construct a filter.
    ///
    /// The continuous process-noise covariance
    ///
    /// $$
    /// Q = \mathrm{blockdiag}(\sigma_a^2 C_a C_a^T, \\; \sigma_\omega^2 C_\omega C_\omega^T,
    /// \\; \sigma_{b_a}^2 I, \\; \sigma_{b_\omega}^2 I)
    /// $$
    ///
    /// and the fixed GNSS covariance are precomputed here.
    ///
    /// # Errors
    /// * [`EskfError::Configuration`] when a noise standard deviation is not positive, a bias
    ///   decay rate is negative, or a correction matrix is singular.
    pub fn new(params: EskfParams) -> Result<Eskf, EskfError> {
        for (name, value) in [
            ("accm_std", params.accm_std),
            ("gyro_std", params.gyro_std),
            ("accm_bias_std", params.accm_bias_std),
            ("gyro_bias_std", params.gyro_bias_std),
            ("gnss_std_ne", params.gnss_std_ne),
            ("gnss_std_d", params.gnss_std_d),
        ] {
            if !(value > 0.0) {
                return Err(EskfError::Configuration(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("accm_bias_p", params.accm_bias_p),
            ("gyro_bias_p", params.gyro_bias_p),
        ] {
            if !(value >= 0.0) {
                return Err(EskfError::Configuration(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        for (name, m) in [
            ("accm_correction", &params.accm_correction),
            ("gyro_correction", &params.gyro_correction),
        ] {
            if m.determinant().abs() < 1e-12 {
                return Err(EskfError::Configuration(format!(
                    "{name} matrix is singular"
                )));
            }
        }

        let mut q_err = SMatrix::<f64, NOISE_DIM, NOISE_DIM>::zeros();
        let ca = params.accm_correction;
        let cg = params.gyro_correction;
        q_err
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(params.accm_std.powi(2) * ca * ca.transpose()));
        q_err
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(params.gyro_std.powi(2) * cg * cg.transpose()));
        q_err
            .fixed_view_mut::<3, 3>(6, 6)
            .copy_from(&(params.accm_bias_std.powi(2) * Matrix3::identity()));
        q_err
            .fixed_view_mut::<3, 3>(9, 9)
            .copy_from(&(params.gyro_bias_std.powi(2) * Matrix3::identity()));

        let gnss_cov = Matrix3::from_diagonal(&Vector3::new(
            params.gnss_std_ne.powi(2),
            params.gnss_std_ne.powi(2),
            params.gnss_std_d.powi(2),
        ));

        Ok(Eskf {
            params,
            q_err,
            gnss_cov,
        })
    }

    /// The filter configuration.
    pub fn params(&self) -> &EskfParams {
        &self.params
    }

    /// Correct a raw IMU measurement with the current bias estimate and the fixed
    /// misalignment/scale correction matrices:
    /// `corrected = C (raw - bias)`, applied independently to each channel.
    ///
    /// Pure function of its inputs; the timestamp passes through unchanged.
    ///
    /// # Arguments
    /// * `x_nom_prev` - Previous nominal state (source of the current bias estimate).
    /// * `z_imu` - Raw IMU measurement.
    pub fn correct_imu(
        &self,
        x_nom_prev: &NominalState,
        z_imu: &ImuMeasurement,
    ) -> CorrectedImuMeasurement {
        CorrectedImuMeasurement {
            acc: self.params.accm_correction * (z_imu.acc - x_nom_prev.accm_bias),
            avel: self.params.gyro_correction * (z_imu.avel - x_nom_prev.gyro_bias),
            ts: z_imu.ts,
        }
    }

    /// Predict the nominal state from a corrected IMU measurement.
    ///
    /// Second-order (constant-acceleration) integration for position and velocity, quaternion
    /// composition for orientation, and exponential decay toward zero for the bias states.
    /// When `dt == 0` (a duplicate sample) the state passes through unchanged apart from the
    /// timestamp; the bias decay evaluates to the identity and the rotation increment would
    /// otherwise divide by a zero norm.
    ///
    /// # Errors
    /// * [`EskfError::NonMonotonicTime`] when the sample predates the state.
    pub fn predict_nominal(
        &self,
        x_nom_prev: NominalState,
        z_corr: &CorrectedImuMeasurement,
    ) -> Result<NominalState, EskfError> {
        let dt = z_corr.ts - x_nom_prev.ts;
        if dt < 0.0 {
            return Err(EskfError::NonMonotonicTime {
                prev: x_nom_prev.ts,
                current: z_corr.ts,
            });
        }

        let accm_bias = x_nom_prev.accm_bias * (-dt * self.params.accm_bias_p).exp();
        let gyro_bias = x_nom_prev.gyro_bias * (-dt * self.params.gyro_bias_p).exp();

        if dt == 0.0 {
            return Ok(NominalState {
                accm_bias,
                gyro_bias,
                ts: z_corr.ts,
                ..x_nom_prev
            });
        }

        let acc = x_nom_prev.ori.rotate(&z_corr.acc) + self.params.gravity;
        let vel = x_nom_prev.vel + dt * acc;
        let pos = x_nom_prev.pos + dt * x_nom_prev.vel + 0.5 * dt * dt * acc;
        let ori = x_nom_prev
            .ori
            .multiply(&RotationQuaternion::from_avec(dt * z_corr.avel));

        Ok(NominalState::new(
            pos, vel, ori, accm_bias, gyro_bias, z_corr.ts,
        ))
    }

    /// The continuous error-state transition matrix `A` (15×15), linearized about the current
    /// nominal state and corrected IMU reading.
    ///
    /// Populated in 3×3 blocks (row, col) over `[pos, vel, att, accm_bias, gyro_bias]`:
    ///
    /// | row\col | pos | vel | att | accm_bias | gyro_bias |
    /// |---|---|---|---|---|---|
    /// | pos | 0 | I | 0 | 0 | 0 |
    /// | vel | 0 | 0 | −R·S(acc) | −R·Cₐ | 0 |
    /// | att | 0 | 0 | −S(avel) | 0 | −Cᵍ |
    /// | accm_bias | 0 | 0 | 0 | −pₐ·I | 0 |
    /// | gyro_bias | 0 | 0 | 0 | 0 | −p_g·I |
    pub fn error_transition_matrix(
        &self,
        x_nom_prev: &NominalState,
        z_corr: &CorrectedImuMeasurement,
    ) -> SMatrix<f64, ERROR_STATE_DIM, ERROR_STATE_DIM> {
        let r = x_nom_prev.ori.as_rotmat();
        let mut a = SMatrix::<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>::zeros();

        let (row, col) = block_3x3(0, 1);
        a.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&Matrix3::identity());
        let (row, col) = block_3x3(1, 2);
        a.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&(-r * cross_matrix(&z_corr.acc)));
        let (row, col) = block_3x3(1, 3);
        a.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&(-r * self.params.accm_correction));
        let (row, col) = block_3x3(2, 2);
        a.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&(-cross_matrix(&z_corr.avel)));
        let (row, col) = block_3x3(2, 4);
        a.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&(-self.params.gyro_correction));
        let (row, col) = block_3x3(3, 3);
        a.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&(-self.params.accm_bias_p * Matrix3::identity()));
        let (row, col) = block_3x3(4, 4);
        a.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&(-self.params.gyro_bias_p * Matrix3::identity()));
        a
    }

    /// The continuous noise-injection term `G Q Gᵀ` (15×15).
    ///
    /// `G` (15×12) maps the four white-noise channels into the error-state derivative:
    /// `G[vel, 0] = -R`, `G[att, 1] = -I`, `G[accm_bias, 2] = I`, `G[gyro_bias, 3] = I`,
    /// all other blocks zero. `Q` is the precomputed block-diagonal process-noise covariance.
    pub fn noise_injection_matrix(
        &self,
        x_nom_prev: &NominalState,
    ) -> SMatrix<f64, ERROR_STATE_DIM, ERROR_STATE_DIM> {
        let r = x_nom_prev.ori.as_rotmat();
        let mut g = SMatrix::<f64, ERROR_STATE_DIM, NOISE_DIM>::zeros();

        let (row, col) = block_3x3(1, 0);
        g.fixed_view_mut::<3, 3>(row, col).copy_from(&(-r));
        let (row, col) = block_3x3(2, 1);
        g.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&(-Matrix3::identity()));
        let (row, col) = block_3x3(3, 2);
        g.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&Matrix3::identity());
        let (row, col) = block_3x3(4, 3);
        g.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&Matrix3::identity());

        g * self.q_err * g.transpose()
    }

    /// Discretize the continuous pair `(A, GQGᵀ)` over `dt` with the Van Loan method.
    ///
    /// Builds the augmented 30×30 matrix
    ///
    /// $$
    /// M = dt \begin{bmatrix} -A & GQG^T \\\\ 0 & A^T \end{bmatrix}
    /// $$
    ///
    /// and evaluates its matrix exponential (exact, or `I + M + M²/2` under
    /// [`Discretization::TaylorSecondOrder`]). The discrete transition matrix is the
    /// transpose of the bottom-right 15×15 block; the discrete noise covariance is that
    /// transition matrix times the top-right block.
    ///
    /// # Returns
    /// * `(Ad, GQGTd)` - discrete transition matrix and discrete noise covariance.
    pub fn discretize_error_dynamics(
        &self,
        x_nom_prev: &NominalState,
        z_corr: &CorrectedImuMeasurement,
    ) -> (
        SMatrix<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>,
        SMatrix<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>,
    ) {
        let dt = z_corr.ts - x_nom_prev.ts;
        let a = self.error_transition_matrix(x_nom_prev, z_corr);
        let gqgt = self.noise_injection_matrix(x_nom_prev);

        let mut m = SMatrix::<f64, 30, 30>::zeros();
        m.fixed_view_mut::<15, 15>(0, 0).copy_from(&(-a));
        m.fixed_view_mut::<15, 15>(0, 15).copy_from(&gqgt);
        m.fixed_view_mut::<15, 15>(15, 15).copy_from(&a.transpose());
        m *= dt;

        let van_loan = match self.params.discretization {
            Discretization::Exact => m.exp(),
            Discretization::TaylorSecondOrder => {
                SMatrix::<f64, 30, 30>::identity() + m + (m * m) * 0.5
            }
        };

        let ad: SMatrix<f64, 15, 15> = van_loan.fixed_view::<15, 15>(15, 15).transpose();
        let top_right: SMatrix<f64, 15, 15> = van_loan.fixed_view::<15, 15>(0, 15).into_owned();
        let gqgtd = ad * top_right;
        (ad, gqgtd)
    }

    /// Predict the error-state Gaussian through one IMU interval.
    ///
    /// Standard linear Kalman prediction with the discretized dynamics:
    /// `mean' = Ad mean`, `cov' = Ad cov Adᵀ + GQGTd`. The covariance is symmetrized to
    /// suppress round-off drift. The timestamp advances to the IMU sample's timestamp.
    ///
    /// # Errors
    /// * [`EskfError::NonMonotonicTime`] when the sample predates the error state.
    pub fn predict_error_state(
        &self,
        x_nom_prev: &NominalState,
        x_err_prev: ErrorStateGauss,
        z_corr: &CorrectedImuMeasurement,
    ) -> Result<ErrorStateGauss, EskfError> {
        if z_corr.ts < x_err_prev.ts {
            return Err(EskfError::NonMonotonicTime {
                prev: x_err_prev.ts,
                current: z_corr.ts,
            });
        }
        let (ad, gqgtd) = self.discretize_error_dynamics(x_nom_prev, z_corr);
        let mean = ad * x_err_prev.mean;
        let cov = linalg::symmetrize(&(ad * x_err_prev.cov * ad.transpose() + gqgtd));
        Ok(ErrorStateGauss::new(mean, cov, z_corr.ts))
    }

    /// Process one raw IMU measurement: correct it, predict the nominal state, and predict
    /// the error state. This is the method to call on every IMU sample.
    ///
    /// # Arguments
    /// * `x_nom_prev` - Previous nominal state.
    /// * `x_err_prev` - Previous error-state Gaussian.
    /// * `z_imu` - Raw IMU measurement.
    ///
    /// # Returns
    /// * The predicted `(NominalState, ErrorStateGauss)` pair at the sample's timestamp.
    ///
    /// # Errors
    /// * [`EskfError::NonMonotonicTime`] when the sample predates the state pair; the caller's
    ///   pair is consumed, so clone before the call if recovery from temporal faults must
    ///   keep the old state.
    pub fn predict_from_imu(
        &self,
        x_nom_prev: NominalState,
        x_err_prev: ErrorStateGauss,
        z_imu: &ImuMeasurement,
    ) -> Result<(NominalState, ErrorStateGauss), EskfError> {
        let z_corr = self.correct_imu(&x_nom_prev, z_imu);
        let x_err_pred = self.predict_error_state(&x_nom_prev, x_err_prev, &z_corr)?;
        let x_nom_pred = self.predict_nominal(x_nom_prev, &z_corr)?;
        Ok((x_nom_pred, x_err_pred))
    }

    /// The GNSS measurement jacobian `H` (3×15).
    ///
    /// Identity on the position block; `−R·S(lever_arm)` on the attitude block, capturing
    /// that a rigidly offset antenna moves with orientation; zero elsewhere.
    pub fn gnss_measurement_jacobian(
        &self,
        x_nom: &NominalState,
    ) -> SMatrix<f64, 3, ERROR_STATE_DIM> {
        let mut h = SMatrix::<f64, 3, ERROR_STATE_DIM>::zeros();
        let (row, col) = block_3x3(0, 0);
        h.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&Matrix3::identity());
        let (row, col) = block_3x3(0, 2);
        h.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&(-x_nom.ori.as_rotmat() * cross_matrix(&self.params.lever_arm)));
        h
    }

    /// The GNSS measurement covariance for one fix.
    ///
    /// Returns the fixed configured covariance, or, when [`EskfParams::use_gnss_accuracy`] is
    /// set and the fix reports an accuracy figure, that covariance scaled by
    /// `(accuracy / 3)^2` (treating the reported figure as a 3-sigma bound).
    pub fn gnss_covariance(&self, z_gnss: &GnssMeasurement) -> Matrix3<f64> {
        match (self.params.use_gnss_accuracy, z_gnss.accuracy) {
            (true, Some(accuracy)) => (accuracy / 3.0).powi(2) * self.gnss_cov,
            _ => self.gnss_cov,
        }
    }

    /// Predict the GNSS measurement distribution.
    ///
    /// Mean: `pos + R·lever_arm`. Covariance: `H P Hᵀ + R_meas`. The fix itself contributes
    /// only its timestamp and (optionally) its accuracy figure.
    pub fn predict_gnss_measurement(
        &self,
        x_nom: &NominalState,
        x_err: &ErrorStateGauss,
        z_gnss: &GnssMeasurement,
    ) -> MultiVarGauss<3> {
        let h = self.gnss_measurement_jacobian(x_nom);
        let mean = x_nom.pos + x_nom.ori.rotate(&self.params.lever_arm);
        let cov = h * x_err.cov * h.transpose() + self.gnss_covariance(z_gnss);
        MultiVarGauss::new(mean, cov, z_gnss.ts)
    }

    /// Update the error-state Gaussian from a GNSS fix.
    ///
    /// Gain `W = P Hᵀ S⁻¹` with `S = H P Hᵀ + R`; updated mean `W (z − ẑ)`; updated
    /// covariance in the Joseph form `(I − WH) P (I − WH)ᵀ + W R Wᵀ`, which preserves
    /// symmetry and PSD-ness under floating-point error accumulation over long runs.
    ///
    /// # Errors
    /// * [`EskfError::SingularInnovation`] when `S` cannot be inverted. The caller still
    ///   holds the prior pair and may skip the update and continue predicting.
    pub fn update_error_state(
        &self,
        x_nom: &NominalState,
        x_err: &ErrorStateGauss,
        z_gnss_pred: &MultiVarGauss<3>,
        z_gnss: &GnssMeasurement,
    ) -> Result<ErrorStateGauss, EskfError> {
        let h = self.gnss_measurement_jacobian(x_nom);
        let p = x_err.cov;
        let r = self.gnss_covariance(z_gnss);

        let s = h * p * h.transpose() + r;
        let s_inv = linalg::invert_spd(&s).ok_or(EskfError::SingularInnovation { ts: z_gnss.ts })?;
        let w = p * h.transpose() * s_inv;

        let i_wh = SMatrix::<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>::identity() - w * h;
        let cov = linalg::symmetrize(&(i_wh * p * i_wh.transpose() + w * r * w.transpose()));
        let mean = w * (z_gnss.pos - z_gnss_pred.mean);
        Ok(ErrorStateGauss::new(mean, cov, z_gnss.ts))
    }

    /// Inject the updated error-state mean into the nominal state and reset the error mean.
    ///
    /// Position, velocity, and biases add directly; the orientation composes with the
    /// small-angle quaternion `(1, δθ/2)` (renormalized by the quaternion constructor). The
    /// error mean is reset to the exact zero vector. Because the attitude injection is a
    /// first-order approximation rather than the exact exponential map, the covariance gets
    /// the matching reset-jacobian correction: block identity except the attitude block
    /// `I − S(δθ/2)`, applied as `P' = G P Gᵀ`. The jacobian is derived for exactly this
    /// approximate injection, which is why the injection is not replaced by an exact map.
    pub fn inject(
        &self,
        x_nom_prev: NominalState,
        x_err_upd: ErrorStateGauss,
    ) -> (NominalState, ErrorStateGauss) {
        let half_avec = 0.5 * x_err_upd.avec();
        let x_nom_inj = NominalState {
            pos: x_nom_prev.pos + x_err_upd.pos(),
            vel: x_nom_prev.vel + x_err_upd.vel(),
            ori: x_nom_prev
                .ori
                .multiply(&RotationQuaternion::new(1.0, half_avec)),
            accm_bias: x_nom_prev.accm_bias + x_err_upd.accm_bias(),
            gyro_bias: x_nom_prev.gyro_bias + x_err_upd.gyro_bias(),
            ts: x_err_upd.ts,
        };

        let mut g = SMatrix::<f64, ERROR_STATE_DIM, ERROR_STATE_DIM>::identity();
        let (row, col) = block_3x3(2, 2);
        g.fixed_view_mut::<3, 3>(row, col)
            .copy_from(&(Matrix3::identity() - cross_matrix(&half_avec)));
        let cov = linalg::symmetrize(&(g * x_err_upd.cov * g.transpose()));

        let x_err_inj = ErrorStateGauss::new(SMatrix::zeros(), cov, x_err_upd.ts);
        (x_nom_inj, x_err_inj)
    }

    /// Process one GNSS fix: predict the measurement, update the error state, and inject.
    /// This is the method to call on every position fix.
    ///
    /// # Arguments
    /// * `x_nom_prev` - Previous nominal state.
    /// * `x_err_prev` - Previous error-state Gaussian.
    /// * `z_gnss` - The position fix.
    ///
    /// # Returns
    /// * The post-injection `(NominalState, ErrorStateGauss)` pair and the predicted
    ///   measurement Gaussian (consumed downstream for NIS consistency metrics).
    ///
    /// # Errors
    /// * [`EskfError::NonMonotonicTime`] when the fix predates the state pair.
    /// * [`EskfError::SingularInnovation`] when the innovation covariance is not invertible.
    pub fn update_from_gnss(
        &self,
        x_nom_prev: NominalState,
        x_err_prev: ErrorStateGauss,
        z_gnss: &GnssMeasurement,
    ) -> Result<(NominalState, ErrorStateGauss, MultiVarGauss<3>), EskfError> {
        if z_gnss.ts < x_nom_prev.ts {
            return Err(EskfError::NonMonotonicTime {
                prev: x_nom_prev.ts,
                current: z_gnss.ts,
            });
        }
        let z_gnss_pred = self.predict_gnss_measurement(&x_nom_prev, &x_err_prev, z_gnss);
        let x_err_upd = self.update_error_state(&x_nom_prev, &x_err_prev, &z_gnss_pred, z_gnss)?;
        let (x_nom_inj, x_err_inj) = self.inject(x_nom_prev, x_err_upd);
        Ok((x_nom_inj, x_err_inj, z_gnss_pred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn test_filter() -> Eskf {
        Eskf::new(EskfParams::default()).unwrap()
    }

    fn stationary_imu(ts: f64) -> ImuMeasurement {
        ImuMeasurement::new(Vector3::new(0.0, 0.0, -9.82), Vector3::zeros(), ts)
    }

    #[test]
    fn test_construction_rejects_bad_noise() {
        let params = EskfParams {
            accm_std: 0.0,
            ..EskfParams::default()
        };
        assert!(matches!(
            Eskf::new(params),
            Err(EskfError::Configuration(_))
        ));
        let params = EskfParams {
            gnss_std_d: -1.0,
            ..EskfParams::default()
        };
        assert!(Eskf::new(params).is_err());
    }

    #[test]
    fn test_construction_rejects_singular_correction() {
        let params = EskfParams {
            accm_correction: Matrix3::zeros(),
            ..EskfParams::default()
        };
        assert!(matches!(
            Eskf::new(params),
            Err(EskfError::Configuration(msg)) if msg.contains("accm_correction")
        ));
    }

    #[test]
    fn test_correct_imu_removes_bias_and_applies_correction() {
        let params = EskfParams {
            accm_correction: 2.0 * Matrix3::identity(),
            ..EskfParams::default()
        };
        let eskf = Eskf::new(params).unwrap();
        let mut x_nom = NominalState::zeros(0.0);
        x_nom.accm_bias = Vector3::new(0.1, 0.0, 0.0);
        x_nom.gyro_bias = Vector3::new(0.0, 0.02, 0.0);
        let z = ImuMeasurement::new(Vector3::new(1.1, 0.0, 0.0), Vector3::new(0.0, 0.05, 0.0), 0.5);
        let z_corr = eskf.correct_imu(&x_nom, &z);
        assert_approx_eq!(z_corr.acc[0], 2.0);
        assert_approx_eq!(z_corr.avel[1], 0.03);
        assert_eq!(z_corr.ts, 0.5);
    }

    #[test]
    fn test_predict_nominal_zero_dt_passes_through() {
        let eskf = test_filter();
        let mut x_nom = NominalState::zeros(1.0);
        x_nom.pos = Vector3::new(1.0, 2.0, 3.0);
        x_nom.vel = Vector3::new(0.5, 0.0, 0.0);
        let z_corr = CorrectedImuMeasurement {
            acc: Vector3::new(0.0, 0.0, -9.82),
            avel: Vector3::new(0.1, 0.0, 0.0),
            ts: 1.0,
        };
        let out = eskf.predict_nominal(x_nom, &z_corr).unwrap();
        assert_eq!(out.pos, x_nom.pos);
        assert_eq!(out.vel, x_nom.vel);
        assert_eq!(out.ori, x_nom.ori);
        assert_eq!(out.ts, 1.0);
    }

    #[test]
    fn test_predict_nominal_rejects_backwards_time() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(2.0);
        let z_corr = CorrectedImuMeasurement {
            acc: Vector3::zeros(),
            avel: Vector3::zeros(),
            ts: 1.5,
        };
        assert!(matches!(
            eskf.predict_nominal(x_nom, &z_corr),
            Err(EskfError::NonMonotonicTime { prev, current }) if prev == 2.0 && current == 1.5
        ));
    }

    #[test]
    fn test_predict_nominal_stationary_cancels_gravity() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(0.0);
        let z_corr = CorrectedImuMeasurement {
            acc: Vector3::new(0.0, 0.0, -9.82),
            avel: Vector3::zeros(),
            ts: 0.01,
        };
        let out = eskf.predict_nominal(x_nom, &z_corr).unwrap();
        assert_approx_eq!(out.pos.norm(), 0.0, 1e-12);
        assert_approx_eq!(out.vel.norm(), 0.0, 1e-12);
    }

    #[test]
    fn test_predict_nominal_constant_acceleration() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(0.0);
        // 1 m/s^2 along x on top of the gravity-cancelling specific force.
        let z_corr = CorrectedImuMeasurement {
            acc: Vector3::new(1.0, 0.0, -9.82),
            avel: Vector3::zeros(),
            ts: 0.1,
        };
        let out = eskf.predict_nominal(x_nom, &z_corr).unwrap();
        assert_approx_eq!(out.vel[0], 0.1, 1e-12);
        assert_approx_eq!(out.pos[0], 0.5 * 0.01, 1e-12);
    }

    #[test]
    fn test_predict_nominal_integrates_rotation() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(0.0);
        let rate = 0.5; // rad/s about z
        let z_corr = CorrectedImuMeasurement {
            acc: Vector3::new(0.0, 0.0, -9.82),
            avel: Vector3::new(0.0, 0.0, rate),
            ts: 0.2,
        };
        let out = eskf.predict_nominal(x_nom, &z_corr).unwrap();
        let euler = out.ori.as_euler();
        assert_approx_eq!(euler[2], rate * 0.2, 1e-12);
    }

    #[test]
    fn test_predict_nominal_decays_biases() {
        let params = EskfParams {
            accm_bias_p: 0.5,
            gyro_bias_p: 0.25,
            ..EskfParams::default()
        };
        let eskf = Eskf::new(params).unwrap();
        let mut x_nom = NominalState::zeros(0.0);
        x_nom.accm_bias = Vector3::new(1.0, 0.0, 0.0);
        x_nom.gyro_bias = Vector3::new(0.0, 1.0, 0.0);
        let out = eskf.predict_nominal(x_nom, &stationary_imu(2.0).into_corrected()).unwrap();
        assert_approx_eq!(out.accm_bias[0], (-1.0_f64).exp(), 1e-12);
        assert_approx_eq!(out.gyro_bias[1], (-0.5_f64).exp(), 1e-12);
    }

    #[test]
    fn test_error_transition_matrix_blocks() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(0.0);
        let z_corr = CorrectedImuMeasurement {
            acc: Vector3::new(0.0, 0.0, -9.82),
            avel: Vector3::new(0.0, 0.0, 0.1),
            ts: 0.01,
        };
        let a = eskf.error_transition_matrix(&x_nom, &z_corr);
        // pos row: identity on the velocity block
        assert_eq!(a[(0, 3)], 1.0);
        assert_eq!(a[(1, 4)], 1.0);
        assert_eq!(a[(2, 5)], 1.0);
        // vel row: -R S(acc) on the attitude block; identity R here
        let expected = -cross_matrix(&z_corr.acc);
        for i in 0..3 {
            for j in 0..3 {
                assert_approx_eq!(a[(3 + i, 6 + j)], expected[(i, j)]);
            }
        }
        // att row: -S(avel) on its own block
        assert_approx_eq!(a[(6, 7)], 0.1);
        assert_approx_eq!(a[(7, 6)], -0.1);
        // bias decay on the diagonals
        let p = eskf.params().accm_bias_p;
        assert_approx_eq!(a[(9, 9)], -p);
        let p = eskf.params().gyro_bias_p;
        assert_approx_eq!(a[(14, 14)], -p);
        // pos and vel columns of the pos row are otherwise zero
        assert_eq!(a[(0, 0)], 0.0);
        assert_eq!(a[(0, 6)], 0.0);
    }

    #[test]
    fn test_noise_injection_matrix_structure() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(0.0);
        let gqgt = eskf.noise_injection_matrix(&x_nom);
        assert!(linalg::is_symmetric(&gqgt, 1e-12));
        // Position block receives no direct noise
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(gqgt[(i, j)], 0.0);
            }
        }
        // Velocity, attitude, and both bias blocks have positive diagonals
        let p = eskf.params();
        assert_approx_eq!(gqgt[(3, 3)], p.accm_std.powi(2));
        assert_approx_eq!(gqgt[(6, 6)], p.gyro_std.powi(2));
        assert_approx_eq!(gqgt[(9, 9)], p.accm_bias_std.powi(2));
        assert_approx_eq!(gqgt[(12, 12)], p.gyro_bias_std.powi(2));
    }

    #[test]
    fn test_discretization_taylor_matches_exact_for_small_dt() {
        let exact = test_filter();
        let taylor = Eskf::new(EskfParams {
            discretization: Discretization::TaylorSecondOrder,
            ..EskfParams::default()
        })
        .unwrap();
        let x_nom = NominalState::zeros(0.0);
        let z_corr = CorrectedImuMeasurement {
            acc: Vector3::new(0.3, -0.1, -9.82),
            avel: Vector3::new(0.05, 0.02, -0.01),
            ts: 0.01,
        };
        let (ad_e, gqgtd_e) = exact.discretize_error_dynamics(&x_nom, &z_corr);
        let (ad_t, gqgtd_t) = taylor.discretize_error_dynamics(&x_nom, &z_corr);
        assert!((ad_e - ad_t).norm() / ad_e.norm() < 1e-3);
        assert!((gqgtd_e - gqgtd_t).norm() / gqgtd_e.norm() < 1e-3);
    }

    #[test]
    fn test_discretization_modes_diverge_for_large_dt() {
        let exact = test_filter();
        let taylor = Eskf::new(EskfParams {
            discretization: Discretization::TaylorSecondOrder,
            ..EskfParams::default()
        })
        .unwrap();
        let x_nom = NominalState::zeros(0.0);
        let z_corr = CorrectedImuMeasurement {
            acc: Vector3::new(2.0, -1.0, -9.82),
            avel: Vector3::new(0.5, 0.4, -0.3),
            ts: 5.0,
        };
        let (ad_e, _) = exact.discretize_error_dynamics(&x_nom, &z_corr);
        let (ad_t, _) = taylor.discretize_error_dynamics(&x_nom, &z_corr);
        assert!((ad_e - ad_t).norm() / ad_e.norm() > 1e-2);
    }

    #[test]
    fn test_predict_error_state_grows_covariance() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(0.0);
        let x_err = eskf.params().initial_error_state(0.0);
        let trace_before = x_err.cov.trace();
        let z_corr = eskf.correct_imu(&x_nom, &stationary_imu(0.01));
        let x_err_pred = eskf.predict_error_state(&x_nom, x_err, &z_corr).unwrap();
        assert!(x_err_pred.cov.trace() > trace_before);
        assert_eq!(x_err_pred.ts, 0.01);
        assert!(x_err_pred.check_invariants(1e-9).is_ok());
    }

    #[test]
    fn test_gnss_jacobian_without_lever_arm() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(0.0);
        let h = eskf.gnss_measurement_jacobian(&x_nom);
        for i in 0..3 {
            for j in 0..15 {
                let expected = if j == i { 1.0 } else { 0.0 };
                assert_eq!(h[(i, j)], expected);
            }
        }
    }

    #[test]
    fn test_gnss_jacobian_with_lever_arm() {
        let params = EskfParams {
            lever_arm: Vector3::new(0.5, 0.0, -0.2),
            ..EskfParams::default()
        };
        let eskf = Eskf::new(params).unwrap();
        let x_nom = NominalState::zeros(0.0);
        let h = eskf.gnss_measurement_jacobian(&x_nom);
        let expected = -cross_matrix(&Vector3::new(0.5, 0.0, -0.2));
        for i in 0..3 {
            for j in 0..3 {
                assert_approx_eq!(h[(i, 6 + j)], expected[(i, j)]);
            }
        }
    }

    #[test]
    fn test_predicted_measurement_mean_includes_lever_arm() {
        let params = EskfParams {
            lever_arm: Vector3::new(1.0, 0.0, 0.0),
            ..EskfParams::default()
        };
        let eskf = Eskf::new(params).unwrap();
        let mut x_nom = NominalState::zeros(0.0);
        x_nom.pos = Vector3::new(10.0, 0.0, 0.0);
        // Half turn about z points the lever arm backwards.
        x_nom.ori = RotationQuaternion::from_euler(Vector3::new(0.0, 0.0, std::f64::consts::PI));
        let x_err = eskf.params().initial_error_state(0.0);
        let z_gnss = GnssMeasurement::new(Vector3::zeros(), 0.0);
        let pred = eskf.predict_gnss_measurement(&x_nom, &x_err, &z_gnss);
        assert_approx_eq!(pred.mean[0], 9.0, 1e-12);
    }

    #[test]
    fn test_gnss_covariance_accuracy_scaling() {
        let params = EskfParams {
            use_gnss_accuracy: true,
            ..EskfParams::default()
        };
        let eskf = Eskf::new(params).unwrap();
        let base = eskf.gnss_covariance(&GnssMeasurement::new(Vector3::zeros(), 0.0));
        let scaled = eskf.gnss_covariance(&GnssMeasurement::with_accuracy(
            Vector3::zeros(),
            0.0,
            6.0,
        ));
        assert_approx_eq!(scaled[(0, 0)], 4.0 * base[(0, 0)]);
        // Without the flag the accuracy figure is ignored.
        let plain = test_filter();
        let same = plain.gnss_covariance(&GnssMeasurement::with_accuracy(
            Vector3::zeros(),
            0.0,
            6.0,
        ));
        assert_approx_eq!(same[(0, 0)], base[(0, 0)]);
    }

    #[test]
    fn test_update_reduces_covariance_trace() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(0.0);
        let x_err = eskf.params().initial_error_state(0.0);
        let trace_before = x_err.cov.trace();
        let z_gnss = GnssMeasurement::new(Vector3::new(0.2, -0.1, 0.05), 0.0);
        let (_, x_err_upd, _) = eskf.update_from_gnss(x_nom, x_err, &z_gnss).unwrap();
        assert!(x_err_upd.cov.trace() < trace_before);
        assert!(x_err_upd.check_invariants(1e-9).is_ok());
    }

    #[test]
    fn test_exact_fix_yields_zero_mean_update() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(0.0);
        let x_err = eskf.params().initial_error_state(0.0);
        let pred = eskf.predict_gnss_measurement(&x_nom, &x_err, &GnssMeasurement::new(Vector3::zeros(), 0.0));
        let z_gnss = GnssMeasurement::new(pred.mean, 0.0);
        let (x_nom_inj, x_err_inj, _) = eskf.update_from_gnss(x_nom, x_err, &z_gnss).unwrap();
        assert_approx_eq!(x_nom_inj.pos.norm(), 0.0, 1e-12);
        assert_eq!(x_err_inj.mean.norm(), 0.0);
    }

    #[test]
    fn test_inject_folds_error_into_nominal() {
        let eskf = test_filter();
        let mut x_nom = NominalState::zeros(1.0);
        x_nom.pos = Vector3::new(1.0, 1.0, 1.0);
        let mut mean = nalgebra::SVector::<f64, 15>::zeros();
        mean[0] = 0.5; // dpos x
        mean[4] = -0.25; // dvel y
        mean[8] = 0.1; // dtheta z
        mean[9] = 0.01; // daccm_bias x
        let x_err = ErrorStateGauss::new(mean, SMatrix::identity(), 1.0);
        let (x_nom_inj, x_err_inj) = eskf.inject(x_nom, x_err);
        assert_approx_eq!(x_nom_inj.pos[0], 1.5);
        assert_approx_eq!(x_nom_inj.vel[1], -0.25);
        assert_approx_eq!(x_nom_inj.accm_bias[0], 0.01);
        // Attitude composes with the small-angle quaternion (1, dtheta/2)
        let expected = RotationQuaternion::new(1.0, Vector3::new(0.0, 0.0, 0.05));
        let diff = (x_nom_inj.ori.as_rotmat() - expected.as_rotmat()).norm();
        assert_approx_eq!(diff, 0.0, 1e-12);
        // Error mean resets to exactly zero
        assert_eq!(x_err_inj.mean.norm(), 0.0);
        assert!(x_err_inj.check_invariants(1e-9).is_ok());
    }

    #[test]
    fn test_update_from_gnss_rejects_backwards_time() {
        let eskf = test_filter();
        let x_nom = NominalState::zeros(5.0);
        let x_err = eskf.params().initial_error_state(5.0);
        let z_gnss = GnssMeasurement::new(Vector3::zeros(), 4.0);
        assert!(matches!(
            eskf.update_from_gnss(x_nom, x_err, &z_gnss),
            Err(EskfError::NonMonotonicTime { .. })
        ));
    }

    #[test]
    fn test_initial_state_from_params() {
        let params = EskfParams {
            init_pos: Vector3::new(1.0, 2.0, 3.0),
            init_euler: Vector3::new(0.0, 0.0, 0.5),
            ..EskfParams::default()
        };
        let x_nom = params.initial_nominal_state(2.5);
        assert_eq!(x_nom.pos, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(x_nom.accm_bias.norm(), 0.0);
        assert_approx_eq!(x_nom.ori.as_euler()[2], 0.5, 1e-12);
        assert_eq!(x_nom.ts, 2.5);
    }

    #[test]
    fn test_params_file_round_trip() {
        let dir = std::env::temp_dir();
        let path = dir.join("eskf_params_roundtrip.json");
        let params = EskfParams {
            gnss_std_ne: 0.35,
            use_gnss_accuracy: true,
            ..EskfParams::default()
        };
        params.to_file(&path).unwrap();
        let back = EskfParams::from_file(&path).unwrap();
        assert_approx_eq!(back.gnss_std_ne, 0.35);
        assert!(back.use_gnss_accuracy);
        std::fs::remove_file(&path).ok();
    }

    impl ImuMeasurement {
        /// Test shorthand: treat a raw sample as already corrected.
        fn into_corrected(self) -> CorrectedImuMeasurement {
            CorrectedImuMeasurement {
                acc: self.acc,
                avel: self.avel,
                ts: self.ts,
            }
        }
    }
}
