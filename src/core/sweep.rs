use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::dataset::HistoricalDataset;
use super::engine::run_monte_carlo_with_rng;
use super::error::CoreError;
use super::types::{Allocation, SimulationParams, SweepPoint, SweepResult};

pub const DEFAULT_STEP_PERCENT: u32 = 10;

/// Evenly spaced equity percentages from 0 to 100 inclusive.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AllocationGrid {
    step_percent: u32,
}

impl Default for AllocationGrid {
    fn default() -> Self {
        Self {
            step_percent: DEFAULT_STEP_PERCENT,
        }
    }
}

impl AllocationGrid {
    pub fn with_step(step_percent: u32) -> Result<Self, CoreError> {
        if step_percent == 0 || step_percent > 100 || 100 % step_percent != 0 {
            return Err(CoreError::InvalidInput(format!(
                "sweep step must divide 100 evenly, got {step_percent}"
            )));
        }
        Ok(Self { step_percent })
    }

    pub fn step_percent(&self) -> u32 {
        self.step_percent
    }

    pub fn points(&self) -> Vec<Allocation> {
        (0..=100)
            .step_by(self.step_percent as usize)
            .map(Allocation::from_equity_percent)
            .collect()
    }
}

pub fn run_allocation_sweep(
    dataset: &HistoricalDataset,
    params: &SimulationParams,
    grid: AllocationGrid,
    seed: Option<u64>,
) -> Result<SweepResult, CoreError> {
    match seed {
        Some(seed) => {
            run_allocation_sweep_with_rng(dataset, params, grid, &mut StdRng::seed_from_u64(seed))
        }
        None => run_allocation_sweep_with_rng(dataset, params, grid, &mut rand::thread_rng()),
    }
}

/// Runs the Monte Carlo once per grid point; the allocation in `params` is
/// ignored. Every point draws from the same generator in grid order.
pub fn run_allocation_sweep_with_rng<R: Rng + ?Sized>(
    dataset: &HistoricalDataset,
    params: &SimulationParams,
    grid: AllocationGrid,
    rng: &mut R,
) -> Result<SweepResult, CoreError> {
    let allocations = grid.points();
    let mut points = Vec::with_capacity(allocations.len());
    for allocation in allocations {
        let point_params = params.with_allocation(allocation);
        let result = run_monte_carlo_with_rng(dataset, &point_params, &mut *rng)?;
        points.push(SweepPoint { allocation, result });
    }

    let best_index = best_point_index(&points);
    let total_simulations = points.len() as u64 * u64::from(params.simulations);
    Ok(SweepResult {
        points,
        best_index,
        simulations_per_point: params.simulations,
        total_simulations,
    })
}

/// First point with the strictly highest success rate, so ties resolve
/// toward lower equity.
fn best_point_index(points: &[SweepPoint]) -> usize {
    let mut best = 0;
    for (idx, point) in points.iter().enumerate().skip(1) {
        if point.result.success_rate > points[best].result.success_rate {
            best = idx;
        }
    }
    best
}
