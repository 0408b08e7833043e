mod units;

use axum::{
    Router,
    extract::{Json, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::NaiveDate;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    AggregateResult, Allocation, AllocationGrid, CoreError, DEFAULT_STEP_PERCENT,
    HistoricalDataset, InflationModeKind, MAX_HORIZON_YEARS, SimulationParams, StressTestResult,
    SweepResult, default_anchor, parse_month, round_to, run_allocation_sweep, run_monte_carlo,
    run_stress_test,
};

pub use units::{fraction_to_percent, fraction_to_whole_percent, percent_to_fraction};

pub const DEFAULT_DATA_PATH: &str = "data/monthly_returns.csv";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("simulation task failed: {0}")]
    Task(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Core(CoreError::InvalidInput(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Core(CoreError::DataUnavailable(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "simulation request failed");
        } else {
            info!(error = %self, "rejected simulation request");
        }
        json_response(
            status,
            ErrorResponse {
                error: self.to_string(),
                message: "Monte Carlo simulation failed",
            },
        )
    }
}

/// Simulation inputs in caller units: rates and allocations in percent.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct SimulationArgs {
    #[arg(long, default_value_t = 25, help = "Retirement horizon in years")]
    pub years: u32,
    #[arg(
        long,
        default_value_t = 5.0,
        help = "Initial annual withdrawal as a percent of the starting portfolio"
    )]
    pub withdrawal_rate: f64,
    #[arg(
        long,
        help = "Fixed annual inflation in percent; omit to draw inflation from history"
    )]
    pub inflation: Option<f64>,
    #[arg(long, default_value_t = 70.0, help = "Equity allocation in percent")]
    pub stock_allocation: f64,
    #[arg(long, default_value_t = 30.0, help = "Bond allocation in percent")]
    pub bond_allocation: f64,
    #[arg(long, default_value_t = 100)]
    pub simulations: u32,
    #[arg(long, help = "Seed for reproducible sampling")]
    pub seed: Option<u64>,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct StressArgs {
    #[arg(long, default_value_t = 25, help = "Retirement horizon in years")]
    pub years: u32,
    #[arg(long, default_value_t = 5.0)]
    pub withdrawal_rate: f64,
    #[arg(long, default_value_t = 70.0)]
    pub stock_allocation: f64,
    #[arg(long, default_value_t = 30.0)]
    pub bond_allocation: f64,
    #[arg(long, help = "First month of the replay, YYYY-MM (default 2000-01)")]
    pub start_month: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MonteCarloPayload {
    years: Option<u32>,
    withdrawal_rate: Option<f64>,
    inflation: Option<f64>,
    stock_allocation: Option<f64>,
    bond_allocation: Option<f64>,
    simulations: Option<u32>,
    seed: Option<u64>,
    allocation_sweep: Option<bool>,
    sweep_step: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StressPayload {
    years: Option<u32>,
    withdrawal_rate: Option<f64>,
    stock_allocation: Option<f64>,
    bond_allocation: Option<f64>,
    start_month: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisMode {
    Single,
    Sweep { step_percent: u32 },
}

#[derive(Debug, Clone, PartialEq)]
struct MonteCarloRequest {
    args: SimulationArgs,
    mode: AnalysisMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleRunResponse {
    pub success_rate: f64,
    pub total_simulations: u32,
    pub successes: u32,
    pub failures: u32,
    pub details: SingleRunDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleRunDetails {
    pub avg_final_portfolio: f64,
    pub median_years_to_failure: Option<f64>,
    pub used_bootstrap: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepAllocationResponse {
    pub stock_percent: u32,
    pub bond_percent: u32,
    pub success_rate: f64,
    pub successes: u32,
    pub failures: u32,
    pub avg_final_portfolio: f64,
    pub median_years_to_failure: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BestAllocationResponse {
    pub stock_percent: u32,
    pub bond_percent: u32,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub allocations: Vec<SweepAllocationResponse>,
    pub best_allocation: BestAllocationResponse,
    pub total_combinations: usize,
    pub simulations_per_combination: u32,
    pub total_simulations: u64,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum MonteCarloResponse {
    Single(SingleRunResponse),
    Sweep(SweepResponse),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    months: usize,
    first_month: Option<String>,
    last_month: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: &'static str,
}

pub fn build_params(args: &SimulationArgs) -> Result<SimulationParams, ApiError> {
    check_percent("stockAllocation", args.stock_allocation)?;
    check_percent("bondAllocation", args.bond_allocation)?;
    let allocation = Allocation::new(
        percent_to_fraction(args.stock_allocation),
        percent_to_fraction(args.bond_allocation),
    );
    params_with_allocation(args, allocation)
}

/// Like `build_params`, but the stock/bond split in `args` is ignored since
/// every grid point supplies its own.
pub fn build_sweep_params(args: &SimulationArgs) -> Result<SimulationParams, ApiError> {
    params_with_allocation(args, Allocation::from_equity_percent(0))
}

fn params_with_allocation(
    args: &SimulationArgs,
    allocation: Allocation,
) -> Result<SimulationParams, ApiError> {
    if args.years == 0 || args.years > MAX_HORIZON_YEARS {
        return Err(ApiError::BadRequest(format!(
            "years must be between 1 and {MAX_HORIZON_YEARS}"
        )));
    }
    check_percent("withdrawalRate", args.withdrawal_rate)?;
    if let Some(inflation) = args.inflation {
        if !inflation.is_finite() || inflation <= -100.0 {
            return Err(ApiError::BadRequest(
                "inflation must be a finite percentage above -100".to_string(),
            ));
        }
    }
    if args.simulations == 0 {
        return Err(ApiError::BadRequest("simulations must be > 0".to_string()));
    }

    let params = SimulationParams {
        horizon_years: args.years,
        withdrawal_rate: percent_to_fraction(args.withdrawal_rate),
        fixed_annual_inflation: args.inflation.map(percent_to_fraction),
        allocation,
        simulations: args.simulations,
    };
    params.validate_for_monte_carlo()?;
    Ok(params)
}

fn check_percent(name: &str, value: f64) -> Result<(), ApiError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(ApiError::BadRequest(format!(
            "{name} must be between 0 and 100"
        )));
    }
    Ok(())
}

pub fn build_stress_params(args: &StressArgs) -> Result<(SimulationParams, NaiveDate), ApiError> {
    let anchor = match args.start_month.as_deref() {
        Some(raw) => parse_month(raw).ok_or_else(|| {
            ApiError::BadRequest(format!("startMonth must be YYYY-MM, got {raw:?}"))
        })?,
        None => default_anchor(),
    };
    let params = build_params(&SimulationArgs {
        years: args.years,
        withdrawal_rate: args.withdrawal_rate,
        inflation: None,
        stock_allocation: args.stock_allocation,
        bond_allocation: args.bond_allocation,
        simulations: 1,
        seed: None,
    })?;
    Ok((params, anchor))
}

pub fn monte_carlo_report(
    dataset: &HistoricalDataset,
    args: &SimulationArgs,
    mode: &AnalysisMode,
) -> Result<MonteCarloResponse, ApiError> {
    match mode {
        AnalysisMode::Single => {
            let params = build_params(args)?;
            let result = run_monte_carlo(dataset, &params, args.seed)?;
            info!(
                years = params.horizon_years,
                success_rate = result.success_rate,
                runs = result.total_runs,
                "monte carlo finished"
            );
            Ok(MonteCarloResponse::Single(single_run_response(&result)))
        }
        AnalysisMode::Sweep { step_percent } => {
            let params = build_sweep_params(args)?;
            let grid = AllocationGrid::with_step(*step_percent)?;
            let sweep = run_allocation_sweep(dataset, &params, grid, args.seed)?;
            let best = sweep.best();
            info!(
                points = sweep.points.len(),
                total = sweep.total_simulations,
                best_equity = fraction_to_whole_percent(best.allocation.equity),
                best_success_rate = best.result.success_rate,
                "allocation sweep finished"
            );
            Ok(MonteCarloResponse::Sweep(sweep_response(&sweep)))
        }
    }
}

pub fn stress_test_report(
    dataset: &HistoricalDataset,
    args: &StressArgs,
) -> Result<StressTestResult, ApiError> {
    let (params, anchor) = build_stress_params(args)?;
    let result = run_stress_test(dataset, &params, anchor)?;
    info!(
        start = %result.start_label,
        failed = result.failed,
        snapshots = result.yearly_values.len(),
        "stress test finished"
    );
    Ok(result)
}

fn single_run_response(result: &AggregateResult) -> SingleRunResponse {
    SingleRunResponse {
        success_rate: result.success_rate,
        total_simulations: result.total_runs,
        successes: result.success_count,
        failures: result.failure_count,
        details: SingleRunDetails {
            avg_final_portfolio: round_to(result.mean_final_value_on_success, 0),
            median_years_to_failure: result.median_years_to_failure_on_failure,
            used_bootstrap: result.inflation_mode == InflationModeKind::Bootstrap,
        },
    }
}

fn sweep_response(sweep: &SweepResult) -> SweepResponse {
    let allocations = sweep
        .points
        .iter()
        .map(|point| SweepAllocationResponse {
            stock_percent: fraction_to_whole_percent(point.allocation.equity),
            bond_percent: fraction_to_whole_percent(point.allocation.bond),
            success_rate: point.result.success_rate,
            successes: point.result.success_count,
            failures: point.result.failure_count,
            avg_final_portfolio: round_to(point.result.mean_final_value_on_success, 0),
            median_years_to_failure: point.result.median_years_to_failure_on_failure,
        })
        .collect::<Vec<_>>();
    let best = sweep.best();

    SweepResponse {
        kind: "allocationSweep",
        total_combinations: allocations.len(),
        allocations,
        best_allocation: BestAllocationResponse {
            stock_percent: fraction_to_whole_percent(best.allocation.equity),
            bond_percent: fraction_to_whole_percent(best.allocation.bond),
            success_rate: best.result.success_rate,
        },
        simulations_per_combination: sweep.simulations_per_point,
        total_simulations: sweep.total_simulations,
    }
}

pub fn router(dataset: HistoricalDataset) -> Router {
    Router::new()
        .route(
            "/api/monte-carlo",
            post(monte_carlo_handler).options(preflight_handler),
        )
        .route(
            "/api/stress-test",
            post(stress_test_handler).options(preflight_handler),
        )
        .route("/api/health", get(health_handler))
        .fallback(not_found_handler)
        .with_state(dataset)
}

pub async fn run_http_server(port: u16, dataset: HistoricalDataset) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let months = dataset.len();
    let app = router(dataset);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, months, "retirement simulation API listening");

    axum::serve(listener, app).await
}

async fn monte_carlo_handler(
    State(dataset): State<HistoricalDataset>,
    payload: Result<Json<MonteCarloPayload>, JsonRejection>,
) -> Response {
    let request = match read_payload(payload).and_then(monte_carlo_request_from_payload) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    let outcome = tokio::task::spawn_blocking(move || {
        monte_carlo_report(&dataset, &request.args, &request.mode)
    })
    .await;
    match outcome {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(err)) => err.into_response(),
        Err(join) => ApiError::Task(join.to_string()).into_response(),
    }
}

async fn stress_test_handler(
    State(dataset): State<HistoricalDataset>,
    payload: Result<Json<StressPayload>, JsonRejection>,
) -> Response {
    let args = match read_payload(payload) {
        Ok(payload) => stress_args_from_payload(payload),
        Err(err) => return err.into_response(),
    };
    let outcome = tokio::task::spawn_blocking(move || stress_test_report(&dataset, &args)).await;
    match outcome {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(err)) => err.into_response(),
        Err(join) => ApiError::Task(join.to_string()).into_response(),
    }
}

/// Malformed bodies get the same `{error, message}` shape and headers as
/// every other rejected request.
fn read_payload<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(payload)| payload)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

async fn health_handler(State(dataset): State<HistoricalDataset>) -> Response {
    let month_key = |month: NaiveDate| month.format("%Y-%m").to_string();
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "ok",
            months: dataset.len(),
            first_month: dataset.first_month().map(month_key),
            last_month: dataset.last_month().map(month_key),
        },
    )
}

async fn preflight_handler() -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn not_found_handler() -> Response {
    json_response(
        StatusCode::NOT_FOUND,
        ErrorResponse {
            error: "Not found".to_string(),
            message: "Unknown endpoint",
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

pub fn default_simulation_args() -> SimulationArgs {
    SimulationArgs {
        years: 25,
        withdrawal_rate: 5.0,
        inflation: None,
        stock_allocation: 70.0,
        bond_allocation: 30.0,
        simulations: 100,
        seed: None,
    }
}

pub fn default_stress_args() -> StressArgs {
    StressArgs {
        years: 25,
        withdrawal_rate: 5.0,
        stock_allocation: 70.0,
        bond_allocation: 30.0,
        start_month: None,
    }
}

fn monte_carlo_request_from_payload(
    payload: MonteCarloPayload,
) -> Result<MonteCarloRequest, ApiError> {
    let mut args = default_simulation_args();

    if let Some(v) = payload.years {
        args.years = v;
    }
    if let Some(v) = payload.withdrawal_rate {
        args.withdrawal_rate = v;
    }
    if let Some(v) = payload.inflation {
        args.inflation = Some(v);
    }
    if let Some(v) = payload.stock_allocation {
        args.stock_allocation = v;
    }
    if let Some(v) = payload.bond_allocation {
        args.bond_allocation = v;
    }
    if let Some(v) = payload.simulations {
        args.simulations = v;
    }
    if let Some(v) = payload.seed {
        args.seed = Some(v);
    }

    let mode = if payload.allocation_sweep.unwrap_or(false) {
        AnalysisMode::Sweep {
            step_percent: payload.sweep_step.unwrap_or(DEFAULT_STEP_PERCENT),
        }
    } else {
        if payload.sweep_step.is_some() {
            return Err(ApiError::BadRequest(
                "sweepStep requires allocationSweep: true".to_string(),
            ));
        }
        AnalysisMode::Single
    };

    Ok(MonteCarloRequest { args, mode })
}

fn stress_args_from_payload(payload: StressPayload) -> StressArgs {
    let mut args = default_stress_args();

    if let Some(v) = payload.years {
        args.years = v;
    }
    if let Some(v) = payload.withdrawal_rate {
        args.withdrawal_rate = v;
    }
    if let Some(v) = payload.stock_allocation {
        args.stock_allocation = v;
    }
    if let Some(v) = payload.bond_allocation {
        args.bond_allocation = v;
    }
    if payload.start_month.is_some() {
        args.start_month = payload.start_month;
    }

    args
}

#[cfg(test)]
fn monte_carlo_request_from_json(json: &str) -> Result<MonteCarloRequest, ApiError> {
    let payload = serde_json::from_str::<MonteCarloPayload>(json)
        .map_err(|e| ApiError::BadRequest(format!("Invalid API JSON payload: {e}")))?;
    monte_carlo_request_from_payload(payload)
}
