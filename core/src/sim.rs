//! Scenario generation, CSV data handling, the closed-loop runner, and filter
//! consistency metrics (NIS and NEES).
//!
//! The on-disk format is flat CSV so runs can be produced and inspected with ordinary
//! tooling. A [`SensorRecord`] row always carries an IMU sample and optionally a GNSS fix
//! (empty fields when no fix arrived that step); a [`NavigationResult`] row flattens the
//! estimated state, the per-block standard deviations, and the NIS of the fix consumed at
//! that step, when there was one.

use crate::error::EskfError;
use crate::filter::Eskf;
use crate::states::{ERROR_STATE_DIM, ErrorStateGauss, NominalState};
use crate::{GnssMeasurement, ImuMeasurement};

use chrono::{DateTime, Duration, Utc};
use nalgebra::{SVector, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One row of sensor data: a timestamped IMU sample plus an optional GNSS fix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorRecord {
    /// Wall-clock timestamp of the sample
    pub time: DateTime<Utc>,
    /// Seconds since the start of the run
    pub t: f64,
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub gnss_x: Option<f64>,
    pub gnss_y: Option<f64>,
    pub gnss_z: Option<f64>,
    pub gnss_accuracy: Option<f64>,
}

impl SensorRecord {
    /// The IMU sample of this row.
    pub fn imu_measurement(&self) -> ImuMeasurement {
        ImuMeasurement::new(
            Vector3::new(self.acc_x, self.acc_y, self.acc_z),
            Vector3::new(self.gyro_x, self.gyro_y, self.gyro_z),
            self.t,
        )
    }

    /// The GNSS fix of this row, when all three position fields are present.
    pub fn gnss_measurement(&self) -> Option<GnssMeasurement> {
        match (self.gnss_x, self.gnss_y, self.gnss_z) {
            (Some(x), Some(y), Some(z)) => {
                let pos = Vector3::new(x, y, z);
                Some(match self.gnss_accuracy {
                    Some(accuracy) => GnssMeasurement::with_accuracy(pos, self.t, accuracy),
                    None => GnssMeasurement::new(pos, self.t),
                })
            }
            _ => None,
        }
    }

    /// Read sensor records from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<SensorRecord>, csv::Error> {
        let mut reader = csv::Reader::from_path(path)?;
        reader.deserialize().collect()
    }

    /// Write sensor records to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[SensorRecord], path: P) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One row of filter output: the estimated state, per-block one-sigma bounds, and the NIS
/// of the GNSS fix consumed at this step (empty when the step had no fix).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NavigationResult {
    pub t: f64,
    pub pos_x: f64,
    pub pos_y: f64,
    pub pos_z: f64,
    pub vel_x: f64,
    pub vel_y: f64,
    pub vel_z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub accm_bias_x: f64,
    pub accm_bias_y: f64,
    pub accm_bias_z: f64,
    pub gyro_bias_x: f64,
    pub gyro_bias_y: f64,
    pub gyro_bias_z: f64,
    pub pos_std_x: f64,
    pub pos_std_y: f64,
    pub pos_std_z: f64,
    pub vel_std_x: f64,
    pub vel_std_y: f64,
    pub vel_std_z: f64,
    pub nis: Option<f64>,
}

impl NavigationResult {
    /// Flatten a state pair into a result row.
    pub fn from_state(
        x_nom: &NominalState,
        x_err: &ErrorStateGauss,
        nis: Option<f64>,
    ) -> NavigationResult {
        let euler = x_nom.ori.as_euler();
        NavigationResult {
            t: x_nom.ts,
            pos_x: x_nom.pos[0],
            pos_y: x_nom.pos[1],
            pos_z: x_nom.pos[2],
            vel_x: x_nom.vel[0],
            vel_y: x_nom.vel[1],
            vel_z: x_nom.vel[2],
            roll: euler[0],
            pitch: euler[1],
            yaw: euler[2],
            accm_bias_x: x_nom.accm_bias[0],
            accm_bias_y: x_nom.accm_bias[1],
            accm_bias_z: x_nom.accm_bias[2],
            gyro_bias_x: x_nom.gyro_bias[0],
            gyro_bias_y: x_nom.gyro_bias[1],
            gyro_bias_z: x_nom.gyro_bias[2],
            pos_std_x: x_err.cov[(0, 0)].sqrt(),
            pos_std_y: x_err.cov[(1, 1)].sqrt(),
            pos_std_z: x_err.cov[(2, 2)].sqrt(),
            vel_std_x: x_err.cov[(3, 3)].sqrt(),
            vel_std_y: x_err.cov[(4, 4)].sqrt(),
            vel_std_z: x_err.cov[(5, 5)].sqrt(),
            nis,
        }
    }

    /// Read result rows from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<NavigationResult>, csv::Error> {
        let mut reader = csv::Reader::from_path(path)?;
        reader.deserialize().collect()
    }

    /// Write result rows to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(results: &[NavigationResult], path: P) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for result in results {
            writer.serialize(result)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Configuration of the synthetic stationary scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Number of IMU steps
    pub n_steps: usize,
    /// IMU sample interval, s
    pub dt: f64,
    /// A GNSS fix every this many IMU steps (0 disables GNSS)
    pub gnss_interval: usize,
    /// RNG seed, so scenarios are reproducible
    pub seed: u64,
    /// Accelerometer noise standard deviation, m/s^2
    pub acc_noise_std: f64,
    /// Gyroscope noise standard deviation, rad/s
    pub gyro_noise_std: f64,
    /// GNSS horizontal noise standard deviation, m
    pub gnss_noise_ne: f64,
    /// GNSS vertical noise standard deviation, m
    pub gnss_noise_d: f64,
    /// Reported accuracy figure attached to each fix, if any
    pub gnss_accuracy: Option<f64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            n_steps: 6000,
            dt: 0.01,
            gnss_interval: 100,
            seed: 42,
            acc_noise_std: 0.05,
            gyro_noise_std: 0.002,
            gnss_noise_ne: 0.5,
            gnss_noise_d: 2.0,
            gnss_accuracy: None,
        }
    }
}

/// Generate a stationary scenario: the vehicle sits at the origin with identity attitude,
/// so the true specific force is exactly `-g` and the true angular rate is zero. Sensor
/// rows carry those truths plus seeded Gaussian noise, with a noisy fix of the origin every
/// `gnss_interval` steps.
///
/// # Errors
/// * [`EskfError::Configuration`] when a noise standard deviation is negative or `dt` is not
///   positive.
pub fn generate_stationary_scenario(config: &ScenarioConfig) -> Result<Vec<SensorRecord>, EskfError> {
    if !(config.dt > 0.0) {
        return Err(EskfError::Configuration(format!(
            "scenario dt must be positive, got {}",
            config.dt
        )));
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    let acc_noise = normal(config.acc_noise_std)?;
    let gyro_noise = normal(config.gyro_noise_std)?;
    let gnss_noise_ne = normal(config.gnss_noise_ne)?;
    let gnss_noise_d = normal(config.gnss_noise_d)?;

    let start = Utc::now();
    let true_acc = -crate::GRAVITY;
    let mut records = Vec::with_capacity(config.n_steps);
    for step in 1..=config.n_steps {
        let t = step as f64 * config.dt;
        let has_fix = config.gnss_interval > 0 && step % config.gnss_interval == 0;
        let (gnss_x, gnss_y, gnss_z) = if has_fix {
            (
                Some(gnss_noise_ne.sample(&mut rng)),
                Some(gnss_noise_ne.sample(&mut rng)),
                Some(gnss_noise_d.sample(&mut rng)),
            )
        } else {
            (None, None, None)
        };
        records.push(SensorRecord {
            time: start + Duration::microseconds((t * 1e6) as i64),
            t,
            acc_x: true_acc[0] + acc_noise.sample(&mut rng),
            acc_y: true_acc[1] + acc_noise.sample(&mut rng),
            acc_z: true_acc[2] + acc_noise.sample(&mut rng),
            gyro_x: gyro_noise.sample(&mut rng),
            gyro_y: gyro_noise.sample(&mut rng),
            gyro_z: gyro_noise.sample(&mut rng),
            gnss_x,
            gnss_y,
            gnss_z,
            gnss_accuracy: if has_fix { config.gnss_accuracy } else { None },
        });
    }
    Ok(records)
}

fn normal(std: f64) -> Result<Normal<f64>, EskfError> {
    Normal::new(0.0, std)
        .map_err(|e| EskfError::Configuration(format!("invalid noise standard deviation: {e}")))
}

/// Run the filter over a recorded data set: predict on every IMU sample and update on every
/// fix, producing one result row per sensor row.
///
/// A singular innovation covariance skips that fix and keeps predicting with the prior pair;
/// temporal faults abort the run.
pub fn run_closed_loop(
    eskf: &Eskf,
    records: &[SensorRecord],
    mut x_nom: NominalState,
    mut x_err: ErrorStateGauss,
) -> Result<Vec<NavigationResult>, EskfError> {
    let mut results = Vec::with_capacity(records.len());
    for record in records {
        let z_imu = record.imu_measurement();
        (x_nom, x_err) = eskf.predict_from_imu(x_nom, x_err, &z_imu)?;

        let mut nis = None;
        if let Some(z_gnss) = record.gnss_measurement() {
            match eskf.update_from_gnss(x_nom, x_err.clone(), &z_gnss) {
                Ok((x_nom_upd, x_err_upd, z_pred)) => {
                    nis = get_nis(&z_pred, &z_gnss, false);
                    x_nom = x_nom_upd;
                    x_err = x_err_upd;
                }
                Err(EskfError::SingularInnovation { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        results.push(NavigationResult::from_state(&x_nom, &x_err, nis));
    }
    Ok(results)
}

/// Normalized innovation squared of one fix against its predicted distribution.
///
/// With `planar` set, the metric covers only the horizontal (x, y) components, which is the
/// common choice when the vertical channel is tuned loosely. Returns `None` when the
/// predicted covariance is not invertible.
pub fn get_nis(
    z_gnss_pred: &crate::states::MultiVarGauss<3>,
    z_gnss: &GnssMeasurement,
    planar: bool,
) -> Option<f64> {
    if planar {
        let marginal = z_gnss_pred.marginal([0, 1]);
        marginal.mahalanobis_distance_sq(&z_gnss.pos.xy())
    } else {
        z_gnss_pred.mahalanobis_distance_sq(&z_gnss.pos)
    }
}

/// Fraction of consistency-metric samples that fall inside `[lo, hi]`.
///
/// For a well-tuned filter the NIS of a 3-dim measurement is chi-square distributed with
/// 3 degrees of freedom, so roughly 95% of samples should land inside `[0.216, 9.348]`
/// (the 2.5%/97.5% quantiles). The bounds are passed in rather than computed, so the same
/// function scores planar NIS (2 dof) and per-block NEES.
pub fn fraction_in_interval(values: &[f64], lo: f64, hi: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let inside = values.iter().filter(|&&v| v >= lo && v <= hi).count();
    inside as f64 / values.len() as f64
}

/// The true error state of an estimate against ground truth, in the 15-dim error frame.
///
/// Position, velocity, and bias components subtract directly; the attitude component is the
/// rotation vector of the quaternion taking the estimated attitude to the true one.
pub fn get_error(x_nom: &NominalState, x_true: &NominalState) -> SVector<f64, ERROR_STATE_DIM> {
    let d_ori = x_nom.ori.conjugate().multiply(&x_true.ori);
    let mut error = SVector::<f64, ERROR_STATE_DIM>::zeros();
    error.fixed_rows_mut::<3>(0).copy_from(&(x_true.pos - x_nom.pos));
    error.fixed_rows_mut::<3>(3).copy_from(&(x_true.vel - x_nom.vel));
    error.fixed_rows_mut::<3>(6).copy_from(&d_ori.as_avec());
    error
        .fixed_rows_mut::<3>(9)
        .copy_from(&(x_true.accm_bias - x_nom.accm_bias));
    error
        .fixed_rows_mut::<3>(12)
        .copy_from(&(x_true.gyro_bias - x_nom.gyro_bias));
    error
}

/// Normalized estimation error squared over a chosen subset of error components.
///
/// `indices` selects which of the 15 error components to score, so per-block consistency
/// (position only, attitude only) falls out of the same function. Returns `None` when the
/// selected covariance block is not invertible.
pub fn get_nees<const M: usize>(
    x_err: &ErrorStateGauss,
    error: &SVector<f64, ERROR_STATE_DIM>,
    indices: [usize; M],
) -> Option<f64> {
    let marginal = x_err.as_gauss().marginal(indices);
    let mut selected = SVector::<f64, M>::zeros();
    for (k, &i) in indices.iter().enumerate() {
        selected[k] = error[i];
    }
    marginal.mahalanobis_distance_sq(&selected)
}
