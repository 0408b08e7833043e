mod dataset;
mod engine;
mod error;
mod stress;
mod sweep;
mod types;

pub use dataset::{HistoricalDataset, parse_month};
pub use engine::{
    BootstrapSampler, ChronologicalSlice, MonthSource, MonthStep, PortfolioState,
    monthly_rate_from_annual, round_to, run_monte_carlo, run_monte_carlo_with_rng, simulate_path,
    simulate_path_observed,
};
pub use error::{CoreError, DatasetError};
pub use stress::{default_anchor, month_label, run_stress_test};
pub use sweep::{
    AllocationGrid, DEFAULT_STEP_PERCENT, run_allocation_sweep, run_allocation_sweep_with_rng,
};
pub use types::{
    AggregateResult, Allocation, InflationMode, InflationModeKind, MAX_HORIZON_YEARS,
    MONTHS_PER_YEAR, MonthlyObservation, PRINCIPAL, RunOutcome, SimulationParams,
    StressTestResult, SweepPoint, SweepResult, YearlySnapshot,
};
