use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::dataset::HistoricalDataset;
use super::error::CoreError;
use super::types::{
    AggregateResult, Allocation, InflationMode, MONTHS_PER_YEAR, MonthlyObservation, PRINCIPAL,
    RunOutcome, SimulationParams,
};

/// Supplies the observation used for each simulated month.
pub trait MonthSource {
    /// `None` once the source has nothing left to give.
    fn next_month(&mut self) -> Option<MonthlyObservation>;
}

/// Draws each month independently and uniformly, with replacement, from the
/// full dataset. No serial correlation is modelled.
pub struct BootstrapSampler<'a, R: Rng + ?Sized> {
    observations: &'a [MonthlyObservation],
    rng: &'a mut R,
}

impl<'a, R: Rng + ?Sized> BootstrapSampler<'a, R> {
    pub fn new(
        observations: &'a [MonthlyObservation],
        rng: &'a mut R,
    ) -> Result<Self, CoreError> {
        if observations.is_empty() {
            return Err(CoreError::DataUnavailable(
                "historical dataset is empty".to_string(),
            ));
        }
        Ok(Self { observations, rng })
    }
}

/// Never runs dry.
impl<R: Rng + ?Sized> MonthSource for BootstrapSampler<'_, R> {
    fn next_month(&mut self) -> Option<MonthlyObservation> {
        let idx = self.rng.gen_range(0..self.observations.len());
        Some(self.observations[idx])
    }
}

/// Reads a contiguous slice in chronological order.
pub struct ChronologicalSlice<'a> {
    observations: &'a [MonthlyObservation],
    cursor: usize,
}

impl<'a> ChronologicalSlice<'a> {
    pub fn new(observations: &'a [MonthlyObservation]) -> Self {
        Self {
            observations,
            cursor: 0,
        }
    }
}

impl MonthSource for ChronologicalSlice<'_> {
    fn next_month(&mut self) -> Option<MonthlyObservation> {
        let next = self.observations.get(self.cursor).copied();
        self.cursor += 1;
        next
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MonthStep {
    Continue,
    /// Value fell to zero or below after this month's withdrawal.
    Exhausted,
}

/// Mutable state of one simulated portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioState {
    pub value: f64,
    pub monthly_withdrawal: f64,
    /// Months simulated so far.
    pub month_index: u32,
    pub annual_inflation_accumulator: f64,
}

impl PortfolioState {
    pub fn new(withdrawal_rate: f64) -> Self {
        Self {
            value: PRINCIPAL,
            monthly_withdrawal: PRINCIPAL * withdrawal_rate / f64::from(MONTHS_PER_YEAR),
            month_index: 0,
            annual_inflation_accumulator: 1.0,
        }
    }

    pub fn advance(
        &mut self,
        observation: &MonthlyObservation,
        allocation: Allocation,
        inflation: InflationMode,
    ) -> MonthStep {
        self.month_index += 1;

        let monthly_inflation = match inflation {
            InflationMode::Bootstrap => observation.inflation,
            InflationMode::Fixed { annual_rate } => monthly_rate_from_annual(annual_rate),
        };
        self.annual_inflation_accumulator *= 1.0 + monthly_inflation;

        let equity_value = self.value * allocation.equity * (1.0 + observation.equity_return);
        let bond_value = self.value * allocation.bond * (1.0 + observation.bond_return);
        self.value = equity_value + bond_value;

        self.value -= self.monthly_withdrawal;

        if self.month_index % MONTHS_PER_YEAR == 0 {
            let escalation = match inflation {
                InflationMode::Bootstrap => self.annual_inflation_accumulator,
                InflationMode::Fixed { annual_rate } => 1.0 + annual_rate,
            };
            self.monthly_withdrawal *= escalation;
            self.annual_inflation_accumulator = 1.0;
        }

        if self.value <= 0.0 {
            MonthStep::Exhausted
        } else {
            MonthStep::Continue
        }
    }
}

pub fn monthly_rate_from_annual(annual_rate: f64) -> f64 {
    (1.0 + annual_rate).powf(1.0 / f64::from(MONTHS_PER_YEAR)) - 1.0
}

/// Runs one portfolio for up to `params.total_months()` months. A source
/// that runs dry ends the run early; `months_simulated` on the outcome
/// tells how far it got.
pub fn simulate_path<S: MonthSource + ?Sized>(
    source: &mut S,
    params: &SimulationParams,
    inflation: InflationMode,
) -> RunOutcome {
    simulate_path_observed(source, params, inflation, |_, _| {})
}

/// `simulate_path` with a hook called as `on_month(elapsed, &state)` after
/// every month the portfolio survives.
pub fn simulate_path_observed<S, F>(
    source: &mut S,
    params: &SimulationParams,
    inflation: InflationMode,
    mut on_month: F,
) -> RunOutcome
where
    S: MonthSource + ?Sized,
    F: FnMut(u32, &PortfolioState),
{
    let mut state = PortfolioState::new(params.withdrawal_rate);
    let total_months = params.total_months();

    for month in 0..total_months {
        let Some(observation) = source.next_month() else {
            return RunOutcome::success(state.value, month);
        };
        if state.advance(&observation, params.allocation, inflation) == MonthStep::Exhausted {
            return RunOutcome::failure(month);
        }
        on_month(month + 1, &state);
    }

    RunOutcome::success(state.value, total_months)
}

/// Bootstrap Monte Carlo using a seeded generator when `seed` is given and
/// the thread-local generator otherwise.
pub fn run_monte_carlo(
    dataset: &HistoricalDataset,
    params: &SimulationParams,
    seed: Option<u64>,
) -> Result<AggregateResult, CoreError> {
    match seed {
        Some(seed) => run_monte_carlo_with_rng(dataset, params, &mut StdRng::seed_from_u64(seed)),
        None => run_monte_carlo_with_rng(dataset, params, &mut rand::thread_rng()),
    }
}

pub fn run_monte_carlo_with_rng<R: Rng + ?Sized>(
    dataset: &HistoricalDataset,
    params: &SimulationParams,
    rng: &mut R,
) -> Result<AggregateResult, CoreError> {
    params.validate_for_monte_carlo()?;

    let inflation = params.inflation_mode();
    let mut acc = OutcomeAccumulator::new(params.simulations as usize);
    for _ in 0..params.simulations {
        let mut sampler = BootstrapSampler::new(dataset.observations(), &mut *rng)?;
        acc.push(simulate_path(&mut sampler, params, inflation));
    }

    Ok(acc.into_result(inflation))
}

struct OutcomeAccumulator {
    successes: u32,
    failures: u32,
    final_values: Vec<f64>,
    years_to_failure: Vec<f64>,
}

impl OutcomeAccumulator {
    fn new(expected_runs: usize) -> Self {
        Self {
            successes: 0,
            failures: 0,
            final_values: Vec::with_capacity(expected_runs),
            years_to_failure: Vec::new(),
        }
    }

    fn push(&mut self, outcome: RunOutcome) {
        if outcome.failed {
            self.failures += 1;
            let month = outcome.failure_month.unwrap_or(0);
            self.years_to_failure
                .push(f64::from(month) / f64::from(MONTHS_PER_YEAR));
        } else {
            self.successes += 1;
            self.final_values.push(outcome.final_value.unwrap_or(0.0));
        }
    }

    fn into_result(mut self, inflation: InflationMode) -> AggregateResult {
        let total = self.successes + self.failures;
        let success_rate = if total == 0 {
            0.0
        } else {
            round_to(f64::from(self.successes) / f64::from(total) * 100.0, 1)
        };
        let mean_final_value_on_success = if self.final_values.is_empty() {
            0.0
        } else {
            self.final_values.iter().sum::<f64>() / self.final_values.len() as f64
        };
        let median_years_to_failure_on_failure = if self.years_to_failure.is_empty() {
            None
        } else {
            Some(round_to(percentile(&mut self.years_to_failure, 50.0), 1))
        };

        AggregateResult {
            success_rate,
            total_runs: total,
            success_count: self.successes,
            failure_count: self.failures,
            mean_final_value_on_success,
            median_years_to_failure_on_failure,
            inflation_mode: inflation.kind(),
        }
    }
}

/// Rounds to `decimals` places. Ties go to the even digit, so one success
/// in sixteen runs reports 6.2, not 6.3.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10_f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}
