use chrono::NaiveDate;
use serde::Serialize;

use super::error::CoreError;

/// Notional starting balance of every simulated portfolio. Results are
/// scale-invariant, so the absolute figure only matters for reporting.
pub const PRINCIPAL: f64 = 1_000_000.0;

pub const MONTHS_PER_YEAR: u32 = 12;

/// Longest horizon accepted, in years.
pub const MAX_HORIZON_YEARS: u32 = 200;

const ALLOCATION_SUM_TOLERANCE: f64 = 1e-9;

/// One month of historical market data, all figures as decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonthlyObservation {
    pub equity_return: f64,
    pub bond_return: f64,
    pub inflation: f64,
    /// First day of the calendar month this row describes, when known.
    pub month: Option<NaiveDate>,
}

impl MonthlyObservation {
    pub fn new(equity_return: f64, bond_return: f64, inflation: f64) -> Self {
        Self {
            equity_return,
            bond_return,
            inflation,
            month: None,
        }
    }

    pub fn dated(self, month: NaiveDate) -> Self {
        Self {
            month: Some(month),
            ..self
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub equity: f64,
    pub bond: f64,
}

impl Allocation {
    pub fn new(equity: f64, bond: f64) -> Self {
        Self { equity, bond }
    }

    /// Split expressed as a whole equity percentage; bonds take the rest.
    pub fn from_equity_percent(equity_percent: u32) -> Self {
        let equity = f64::from(equity_percent) / 100.0;
        Self {
            equity,
            bond: f64::from(100 - equity_percent.min(100)) / 100.0,
        }
    }

    pub fn equity_percent(&self) -> u32 {
        (self.equity * 100.0).round() as u32
    }

    pub fn bond_percent(&self) -> u32 {
        (self.bond * 100.0).round() as u32
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.equity) {
            return Err(CoreError::InvalidInput(
                "equity allocation must be between 0 and 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.bond) {
            return Err(CoreError::InvalidInput(
                "bond allocation must be between 0 and 1".to_string(),
            ));
        }
        if (self.equity + self.bond - 1.0).abs() > ALLOCATION_SUM_TOLERANCE {
            return Err(CoreError::InvalidInput(format!(
                "equity and bond allocations must sum to 1, got {}",
                self.equity + self.bond
            )));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum InflationMode {
    /// Each month's inflation comes from the sampled observation.
    Bootstrap,
    /// A constant annual rate, expressed as a decimal.
    Fixed { annual_rate: f64 },
}

impl InflationMode {
    pub fn from_fixed_rate(fixed_annual_inflation: Option<f64>) -> Self {
        match fixed_annual_inflation {
            Some(annual_rate) => Self::Fixed { annual_rate },
            None => Self::Bootstrap,
        }
    }

    pub fn kind(&self) -> InflationModeKind {
        match self {
            Self::Bootstrap => InflationModeKind::Bootstrap,
            Self::Fixed { .. } => InflationModeKind::Fixed,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InflationModeKind {
    Bootstrap,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationParams {
    pub horizon_years: u32,
    pub withdrawal_rate: f64,
    pub fixed_annual_inflation: Option<f64>,
    pub allocation: Allocation,
    pub simulations: u32,
}

impl SimulationParams {
    pub fn total_months(&self) -> u32 {
        self.horizon_years.saturating_mul(MONTHS_PER_YEAR)
    }

    pub fn inflation_mode(&self) -> InflationMode {
        InflationMode::from_fixed_rate(self.fixed_annual_inflation)
    }

    pub fn with_allocation(self, allocation: Allocation) -> Self {
        Self { allocation, ..self }
    }

    /// Rejects inputs the engine cannot give a meaningful answer for.
    /// Checks that only apply to the Monte Carlo path (simulation count)
    /// live in `validate_for_monte_carlo`.
    pub fn validate_path(&self) -> Result<(), CoreError> {
        if self.horizon_years == 0 {
            return Err(CoreError::InvalidInput(
                "horizon must be at least one year".to_string(),
            ));
        }
        if self.horizon_years > MAX_HORIZON_YEARS {
            return Err(CoreError::InvalidInput(format!(
                "horizon must be at most {MAX_HORIZON_YEARS} years, got {}",
                self.horizon_years
            )));
        }
        if !self.withdrawal_rate.is_finite() || !(0.0..=1.0).contains(&self.withdrawal_rate) {
            return Err(CoreError::InvalidInput(
                "withdrawal rate must be between 0 and 1".to_string(),
            ));
        }
        if let Some(rate) = self.fixed_annual_inflation {
            if !rate.is_finite() || rate <= -1.0 {
                return Err(CoreError::InvalidInput(
                    "fixed inflation must be a finite rate above -100%".to_string(),
                ));
            }
        }
        self.allocation.validate()
    }

    pub fn validate_for_monte_carlo(&self) -> Result<(), CoreError> {
        self.validate_path()?;
        if self.simulations == 0 {
            return Err(CoreError::InvalidInput(
                "simulation count must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOutcome {
    pub failed: bool,
    /// Zero-based month in which the value reached zero or below.
    pub failure_month: Option<u32>,
    pub final_value: Option<f64>,
    /// Months actually applied. Below the horizon when a chronological
    /// source ran out of data before the run ended.
    pub months_simulated: u32,
}

impl RunOutcome {
    pub fn success(final_value: f64, months_simulated: u32) -> Self {
        Self {
            failed: false,
            failure_month: None,
            final_value: Some(final_value),
            months_simulated,
        }
    }

    pub fn failure(failure_month: u32) -> Self {
        Self {
            failed: true,
            failure_month: Some(failure_month),
            final_value: None,
            months_simulated: failure_month + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    /// Percentage of runs that survived, 0–100, one decimal place.
    pub success_rate: f64,
    pub total_runs: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub mean_final_value_on_success: f64,
    pub median_years_to_failure_on_failure: Option<f64>,
    pub inflation_mode: InflationModeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepPoint {
    pub allocation: Allocation,
    pub result: AggregateResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    pub points: Vec<SweepPoint>,
    pub best_index: usize,
    pub simulations_per_point: u32,
    pub total_simulations: u64,
}

impl SweepResult {
    pub fn best(&self) -> &SweepPoint {
        &self.points[self.best_index]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearlySnapshot {
    pub label: String,
    pub value: f64,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StressTestResult {
    pub start_label: String,
    pub years_requested: u32,
    pub failed: bool,
    pub failure_year: Option<i32>,
    pub yearly_values: Vec<YearlySnapshot>,
}
