//! End-to-end filter runs over synthetic scenarios.
//!
//! These tests drive the full cycle (correct, predict, update, inject) the way the binary
//! does, rather than poking individual operations. The stationary scenario makes the truth
//! trivial: the vehicle never moves, so any drift is filter error.

use assert_approx_eq::assert_approx_eq;
use eskf::filter::{Discretization, Eskf, EskfParams};
use eskf::sim::{
    ScenarioConfig, fraction_in_interval, generate_stationary_scenario, get_error, get_nees,
    run_closed_loop,
};
use eskf::states::NominalState;
use eskf::{EskfError, GnssMeasurement, ImuMeasurement};
use nalgebra::Vector3;

const DT: f64 = 0.01;
const GRAVITY_CANCELLING: Vector3<f64> = Vector3::new(0.0, 0.0, -9.82);

fn stationary_sample(ts: f64) -> ImuMeasurement {
    ImuMeasurement::new(GRAVITY_CANCELLING, Vector3::zeros(), ts)
}

#[test]
fn dead_reckoning_with_perfect_imu_stays_put() {
    let params = EskfParams::default();
    let eskf = Eskf::new(params.clone()).unwrap();
    let mut x_nom = NominalState::zeros(0.0);
    let mut x_err = params.initial_error_state(0.0);
    let mut prev_var = [0.0; 6];
    for axis in 0..6 {
        prev_var[axis] = x_err.cov[(axis, axis)];
    }

    for step in 1..=1000 {
        let z_imu = stationary_sample(step as f64 * DT);
        (x_nom, x_err) = eskf.predict_from_imu(x_nom, x_err, &z_imu).unwrap();

        // Without measurements neither the position nor the velocity uncertainty can shrink:
        // every velocity diagonal gains at least the discretized accelerometer noise, and
        // every position diagonal gains the velocity coupling.
        for axis in 0..6 {
            let var = x_err.cov[(axis, axis)];
            assert!(
                var > prev_var[axis],
                "covariance diagonal {axis} did not grow at step {step}"
            );
            prev_var[axis] = var;
        }
    }

    assert_approx_eq!(x_nom.pos.norm(), 0.0, 1e-9);
    assert_approx_eq!(x_nom.vel.norm(), 0.0, 1e-9);
    assert_eq!(x_nom.ts, 10.0);
    assert!(x_err.check_invariants(1e-9).is_ok());
}

#[test]
fn exact_fix_collapses_position_uncertainty() {
    let params = EskfParams::default();
    let eskf = Eskf::new(params.clone()).unwrap();
    let mut x_nom = NominalState::zeros(0.0);
    let mut x_err = params.initial_error_state(0.0);

    for step in 1..=100 {
        let z_imu = stationary_sample(step as f64 * DT);
        (x_nom, x_err) = eskf.predict_from_imu(x_nom, x_err, &z_imu).unwrap();
    }
    let trace_before = x_err.cov.trace();
    let pos_var_before = x_err.cov[(0, 0)];

    // A fix of the true position: the update must not move the estimate.
    let z_gnss = GnssMeasurement::new(Vector3::zeros(), 1.0);
    let (x_nom, x_err, _) = eskf.update_from_gnss(x_nom, x_err, &z_gnss).unwrap();

    assert_approx_eq!(x_nom.pos.norm(), 0.0, 1e-9);
    assert_eq!(x_err.mean.norm(), 0.0);
    assert!(x_err.cov.trace() < trace_before);
    assert!(x_err.cov[(0, 0)] < pos_var_before);
    assert!(x_err.check_invariants(1e-9).is_ok());
}

#[test]
fn closed_loop_noisy_run_stays_consistent() {
    let config = ScenarioConfig {
        n_steps: 3000,
        dt: DT,
        gnss_interval: 100,
        seed: 7,
        ..ScenarioConfig::default()
    };
    let records = generate_stationary_scenario(&config).unwrap();
    let params = EskfParams::default();
    let eskf = Eskf::new(params.clone()).unwrap();
    let results = run_closed_loop(
        &eskf,
        &records,
        NominalState::zeros(0.0),
        params.initial_error_state(0.0),
    )
    .unwrap();

    assert_eq!(results.len(), 3000);
    let last = results.last().unwrap();

    // Truth is the origin; the estimate should stay within a few GNSS sigma.
    let horizontal = (last.pos_x.powi(2) + last.pos_y.powi(2)).sqrt();
    assert!(horizontal < 3.0, "horizontal drift {horizontal} m");
    assert!(last.pos_z.abs() < 10.0, "vertical drift {} m", last.pos_z);

    // Regular fixes keep the position uncertainty well below the initial 1 m sigma.
    assert!(last.pos_std_x < 1.0);
    assert!(last.pos_std_y < 1.0);

    // NIS of a 3-dim measurement averages near its dimension when the tuning is sane, and
    // most samples stay inside the 95% chi-square interval for 3 degrees of freedom.
    let nis: Vec<f64> = results.iter().filter_map(|r| r.nis).collect();
    assert_eq!(nis.len(), 30);
    let mean_nis = nis.iter().sum::<f64>() / nis.len() as f64;
    assert!(mean_nis > 0.1 && mean_nis < 30.0, "mean NIS {mean_nis}");
    let inside = fraction_in_interval(&nis, 0.216, 9.348);
    assert!(inside > 0.5, "NIS in-interval fraction {inside}");
}

#[test]
fn taylor_discretization_tracks_exact_over_a_run() {
    let config = ScenarioConfig {
        n_steps: 500,
        dt: DT,
        gnss_interval: 100,
        seed: 11,
        ..ScenarioConfig::default()
    };
    let records = generate_stationary_scenario(&config).unwrap();

    let run_with = |mode: Discretization| {
        let params = EskfParams {
            discretization: mode,
            ..EskfParams::default()
        };
        let eskf = Eskf::new(params.clone()).unwrap();
        run_closed_loop(
            &eskf,
            &records,
            NominalState::zeros(0.0),
            params.initial_error_state(0.0),
        )
        .unwrap()
    };

    let exact = run_with(Discretization::Exact);
    let taylor = run_with(Discretization::TaylorSecondOrder);
    let le = exact.last().unwrap();
    let lt = taylor.last().unwrap();
    assert_approx_eq!(le.pos_x, lt.pos_x, 1e-3);
    assert_approx_eq!(le.pos_y, lt.pos_y, 1e-3);
    assert_approx_eq!(le.pos_std_x, lt.pos_std_x, 1e-3);
}

#[test]
fn nees_against_ground_truth_is_bounded() {
    let config = ScenarioConfig {
        n_steps: 2000,
        dt: DT,
        gnss_interval: 100,
        seed: 3,
        ..ScenarioConfig::default()
    };
    let records = generate_stationary_scenario(&config).unwrap();
    let params = EskfParams::default();
    let eskf = Eskf::new(params.clone()).unwrap();

    let mut x_nom = NominalState::zeros(0.0);
    let mut x_err = params.initial_error_state(0.0);
    for record in &records {
        (x_nom, x_err) = eskf
            .predict_from_imu(x_nom, x_err, &record.imu_measurement())
            .unwrap();
        if let Some(z_gnss) = record.gnss_measurement() {
            (x_nom, x_err, _) = eskf.update_from_gnss(x_nom, x_err, &z_gnss).unwrap();
        }
    }

    // Ground truth is the all-zero state.
    let x_true = NominalState::zeros(x_nom.ts);
    let error = get_error(&x_nom, &x_true);
    let nees_pos = get_nees(&x_err, &error, [0, 1, 2]).unwrap();
    // A single-run positional NEES far above the chi-square tail means the filter is
    // overconfident; 50 is a generous bound for 3 degrees of freedom.
    assert!(nees_pos < 50.0, "positional NEES {nees_pos}");
}

#[test]
fn out_of_order_imu_sample_is_fatal() {
    let params = EskfParams::default();
    let eskf = Eskf::new(params.clone()).unwrap();
    let x_nom = NominalState::zeros(0.0);
    let x_err = params.initial_error_state(0.0);

    let (x_nom, x_err) = eskf
        .predict_from_imu(x_nom, x_err, &stationary_sample(1.0))
        .unwrap();
    let result = eskf.predict_from_imu(x_nom, x_err, &stationary_sample(0.5));
    assert!(matches!(
        result,
        Err(EskfError::NonMonotonicTime { prev, current }) if prev == 1.0 && current == 0.5
    ));
}

#[test]
fn out_of_order_fix_aborts_a_closed_loop_run() {
    let config = ScenarioConfig {
        n_steps: 150,
        dt: DT,
        gnss_interval: 100,
        seed: 5,
        ..ScenarioConfig::default()
    };
    let mut records = generate_stationary_scenario(&config).unwrap();
    // Corrupt one timestamp so the stream runs backwards.
    records[120].t = 0.1;

    let params = EskfParams::default();
    let eskf = Eskf::new(params.clone()).unwrap();
    let result = run_closed_loop(
        &eskf,
        &records,
        NominalState::zeros(0.0),
        params.initial_error_state(0.0),
    );
    assert!(matches!(result, Err(EskfError::NonMonotonicTime { .. })));
}
