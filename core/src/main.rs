//! Command-line front end: generate synthetic scenarios and run the filter over recorded
//! data sets.

use clap::{Parser, Subcommand};
use eskf::filter::{Discretization, Eskf, EskfParams};
use eskf::sim::{
    NavigationResult, ScenarioConfig, SensorRecord, generate_stationary_scenario, run_closed_loop,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "eskf", about = "Error-state Kalman filter for IMU/GNSS fusion", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a synthetic stationary scenario and write it as CSV
    Generate {
        /// Output CSV path
        #[arg(short, long, default_value = "scenario.csv")]
        output: PathBuf,
        /// Number of IMU steps
        #[arg(long, default_value_t = 6000)]
        steps: usize,
        /// IMU sample interval in seconds
        #[arg(long, default_value_t = 0.01)]
        dt: f64,
        /// A GNSS fix every this many IMU steps (0 disables GNSS)
        #[arg(long, default_value_t = 100)]
        gnss_interval: usize,
        /// RNG seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Run the filter over a sensor CSV and write the results as CSV
    Run {
        /// Input sensor CSV path
        input: PathBuf,
        /// Output results CSV path
        #[arg(short, long, default_value = "results.csv")]
        output: PathBuf,
        /// Filter configuration file (.json or .toml); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the configured discretization policy
        #[arg(long, value_enum)]
        discretization: Option<Discretization>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Generate {
            output,
            steps,
            dt,
            gnss_interval,
            seed,
        } => {
            let config = ScenarioConfig {
                n_steps: steps,
                dt,
                gnss_interval,
                seed,
                ..ScenarioConfig::default()
            };
            let records = generate_stationary_scenario(&config)?;
            SensorRecord::to_csv(&records, &output)?;
            println!("wrote {} sensor records to {}", records.len(), output.display());
        }
        Command::Run {
            input,
            output,
            config,
            discretization,
        } => {
            let mut params = match config {
                Some(path) => EskfParams::from_file(path)?,
                None => EskfParams::default(),
            };
            if let Some(mode) = discretization {
                params.discretization = mode;
            }
            let eskf = Eskf::new(params.clone())?;

            let records = SensorRecord::from_csv(&input)?;
            if records.is_empty() {
                return Err("input contains no sensor records".into());
            }
            let t0 = records[0].t;
            let results = run_closed_loop(
                &eskf,
                &records,
                params.initial_nominal_state(t0),
                params.initial_error_state(t0),
            )?;
            NavigationResult::to_csv(&results, &output)?;
            print_summary(&results);
            println!("wrote {} result rows to {}", results.len(), output.display());
        }
    }
    Ok(())
}

fn print_summary(results: &[NavigationResult]) {
    let Some(last) = results.last() else {
        return;
    };
    println!(
        "final position: [{:.3}, {:.3}, {:.3}] m (1-sigma [{:.3}, {:.3}, {:.3}])",
        last.pos_x, last.pos_y, last.pos_z, last.pos_std_x, last.pos_std_y, last.pos_std_z
    );
    println!(
        "final velocity: [{:.3}, {:.3}, {:.3}] m/s",
        last.vel_x, last.vel_y, last.vel_z
    );
    let nis: Vec<f64> = results.iter().filter_map(|r| r.nis).collect();
    if !nis.is_empty() {
        let mean = nis.iter().sum::<f64>() / nis.len() as f64;
        println!("mean NIS over {} fixes: {:.3} (expected about 3)", nis.len(), mean);
    }
}
