use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fire_bootstrap::api::{
    self, AnalysisMode, DEFAULT_DATA_PATH, MonteCarloResponse, SimulationArgs, StressArgs,
};
use fire_bootstrap::core::{DEFAULT_STEP_PERCENT, HistoricalDataset};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "fire-bootstrap",
    about = "Historical bootstrap retirement success estimator"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        default_value = DEFAULT_DATA_PATH,
        help = "Monthly returns CSV (Date, SP500_Total_Return, Treasury_5Y_Total_Return, Inflation_Monthly)"
    )]
    data: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Bootstrap Monte Carlo for a single allocation.
    Simulate {
        #[command(flatten)]
        args: SimulationArgs,
        #[arg(long)]
        json: bool,
    },
    /// Monte Carlo across equity allocations from 0% to 100%.
    Sweep {
        #[command(flatten)]
        args: SimulationArgs,
        #[arg(long, default_value_t = DEFAULT_STEP_PERCENT, help = "Equity step in percent; must divide 100")]
        step: u32,
        #[arg(long)]
        json: bool,
    },
    /// Replay one historical sequence from a start month.
    StressTest {
        #[command(flatten)]
        args: StressArgs,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let dataset = HistoricalDataset::from_csv_path(&cli.data)
        .with_context(|| format!("loading historical data from {}", cli.data.display()))?;
    info!(
        path = %cli.data.display(),
        months = dataset.len(),
        "historical data loaded"
    );

    match cli.command {
        Command::Serve { port } => api::run_http_server(port, dataset)
            .await
            .context("HTTP server stopped")?,
        Command::Simulate { args, json } => {
            let report = api::monte_carlo_report(&dataset, &args, &AnalysisMode::Single)?;
            emit(&report, json, print_monte_carlo)?;
        }
        Command::Sweep { args, step, json } => {
            let mode = AnalysisMode::Sweep { step_percent: step };
            let report = api::monte_carlo_report(&dataset, &args, &mode)?;
            emit(&report, json, print_monte_carlo)?;
        }
        Command::StressTest { args, json } => {
            let report = api::stress_test_report(&dataset, &args)?;
            emit(&report, json, |r| {
                println!("Start: {}  Horizon: {} years", r.start_label, r.years_requested);
                for snap in &r.yearly_values {
                    println!("  {:<10} {:>14.0}", snap.label, snap.value);
                }
                match r.failure_year {
                    Some(year) => println!("Portfolio exhausted in {year}"),
                    None => println!("Portfolio survived"),
                }
            })?;
        }
    }

    Ok(())
}

fn emit<T: Serialize>(report: &T, json: bool, table: impl Fn(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        table(report);
    }
    Ok(())
}

fn print_monte_carlo(report: &MonteCarloResponse) {
    match report {
        MonteCarloResponse::Single(run) => {
            println!(
                "Success rate: {:.1}% ({} of {} runs)",
                run.success_rate, run.successes, run.total_simulations
            );
            println!(
                "Average final portfolio (survivors): {:.0}",
                run.details.avg_final_portfolio
            );
            match run.details.median_years_to_failure {
                Some(years) => println!("Median years to failure: {years:.1}"),
                None => println!("Median years to failure: n/a"),
            }
            let inflation = if run.details.used_bootstrap {
                "historical"
            } else {
                "fixed"
            };
            println!("Inflation: {inflation}");
        }
        MonteCarloResponse::Sweep(sweep) => {
            println!("{:>6} {:>6} {:>9} {:>14}", "stock", "bond", "success", "avg final");
            for row in &sweep.allocations {
                println!(
                    "{:>5}% {:>5}% {:>8.1}% {:>14.0}",
                    row.stock_percent, row.bond_percent, row.success_rate, row.avg_final_portfolio
                );
            }
            println!(
                "Best: {}/{} at {:.1}% over {} simulations",
                sweep.best_allocation.stock_percent,
                sweep.best_allocation.bond_percent,
                sweep.best_allocation.success_rate,
                sweep.total_simulations
            );
        }
    }
}
