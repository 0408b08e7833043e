use chrono::{Datelike, Months, NaiveDate};

use super::dataset::{HistoricalDataset, first_of_month};
use super::engine::{ChronologicalSlice, simulate_path_observed};
use super::error::CoreError;
use super::types::{
    InflationMode, MONTHS_PER_YEAR, PRINCIPAL, SimulationParams, StressTestResult, YearlySnapshot,
};

/// January 2000: the equity peak ahead of the 2000–2002 bear market.
pub fn default_anchor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

pub fn month_label(month: NaiveDate) -> String {
    month.format("%b %Y").to_string()
}

/// Replays history month by month from `anchor`, with no resampling.
///
/// Always uses the slice's own inflation; `params.fixed_annual_inflation`
/// and `params.simulations` are not consulted. A snapshot is taken at the
/// anchor month and at every anniversary of it. Every label names a month
/// present in the data and appears once: an anniversary that falls just past
/// the end of the data is labelled with the last month instead. When the
/// requested horizon runs past the data the whole slice is replayed and the
/// final value is recorded at its last month, replacing a snapshot that
/// already carries that label. At least one year of data from the anchor is
/// required.
pub fn run_stress_test(
    dataset: &HistoricalDataset,
    params: &SimulationParams,
    anchor: NaiveDate,
) -> Result<StressTestResult, CoreError> {
    params.validate_path()?;
    let anchor = first_of_month(anchor);
    if dataset.first_month().is_none() {
        return Err(CoreError::DataUnavailable(
            "stress test needs a dataset with calendar months".to_string(),
        ));
    }
    let start = dataset.index_of_month(anchor).ok_or_else(|| {
        CoreError::DataUnavailable(format!(
            "no historical data for start month {}",
            anchor.format("%Y-%m")
        ))
    })?;

    let slice = &dataset.observations()[start..];
    let slice_months = slice.len() as u32;
    if slice_months < MONTHS_PER_YEAR {
        return Err(CoreError::DataUnavailable(format!(
            "stress test needs a year of data from {}, found {slice_months} months",
            anchor.format("%Y-%m")
        )));
    }
    let month_at = |offset: u32| {
        slice
            .get(offset as usize)
            .and_then(|o| o.month)
            .unwrap_or_else(|| add_months(anchor, offset))
    };
    let last_month = month_at(slice_months - 1);

    let mut yearly_values = vec![snapshot(anchor, PRINCIPAL)];
    let mut source = ChronologicalSlice::new(slice);
    let outcome = simulate_path_observed(
        &mut source,
        params,
        InflationMode::Bootstrap,
        |elapsed, state| {
            if elapsed % MONTHS_PER_YEAR == 0 {
                let label_month = if elapsed < slice_months {
                    month_at(elapsed)
                } else {
                    last_month
                };
                yearly_values.push(snapshot(label_month, state.value));
            }
        },
    );

    if let Some(failure_month) = outcome.failure_month {
        return Ok(StressTestResult {
            start_label: month_label(anchor),
            years_requested: params.horizon_years,
            failed: true,
            failure_year: Some(month_at(failure_month).year()),
            yearly_values,
        });
    }

    if outcome.months_simulated < params.total_months() {
        let trailing = snapshot(last_month, outcome.final_value.unwrap_or_default());
        match yearly_values.last_mut() {
            Some(previous) if previous.label == trailing.label => *previous = trailing,
            _ => yearly_values.push(trailing),
        }
    }

    Ok(StressTestResult {
        start_label: month_label(anchor),
        years_requested: params.horizon_years,
        failed: false,
        failure_year: None,
        yearly_values,
    })
}

fn snapshot(month: NaiveDate, value: f64) -> YearlySnapshot {
    YearlySnapshot {
        label: month_label(month),
        value,
        year: month.year(),
    }
}

fn add_months(month: NaiveDate, months: u32) -> NaiveDate {
    month.checked_add_months(Months::new(months)).unwrap_or(month)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Allocation, MonthlyObservation};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn ymd(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).expect("valid date")
    }

    /// Flat rows from January 1999 for `months` months.
    fn flat_history(months: usize, inflation: f64) -> HistoricalDataset {
        let rows = vec![MonthlyObservation::new(0.0, 0.0, inflation); months];
        HistoricalDataset::dated_from(ymd(1999, 1), rows).expect("dataset")
    }

    fn sample_params(horizon_years: u32, withdrawal_rate: f64) -> SimulationParams {
        SimulationParams {
            horizon_years,
            withdrawal_rate,
            fixed_annual_inflation: None,
            allocation: Allocation::new(0.6, 0.4),
            simulations: 1,
        }
    }

    #[test]
    fn horizon_inside_history_yields_one_snapshot_per_anniversary() {
        let dataset = flat_history(72, 0.0);
        let result = run_stress_test(&dataset, &sample_params(3, 0.04), ymd(2000, 1))
            .expect("valid stress test");

        assert!(!result.failed);
        assert_eq!(result.failure_year, None);
        assert_eq!(result.start_label, "Jan 2000");
        assert_eq!(result.years_requested, 3);
        assert_eq!(result.yearly_values.len(), 4);

        let labels: Vec<_> = result.yearly_values.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, ["Jan 2000", "Jan 2001", "Jan 2002", "Jan 2003"]);
        let years: Vec<_> = result.yearly_values.iter().map(|s| s.year).collect();
        assert_eq!(years, [2000, 2001, 2002, 2003]);
        for (idx, snap) in result.yearly_values.iter().enumerate() {
            assert_approx(snap.value, PRINCIPAL - 40_000.0 * idx as f64);
        }
    }

    #[test]
    fn horizon_past_history_appends_last_month() {
        // January 1999 + 66 months ends June 2004; 54 months from the anchor.
        let dataset = flat_history(66, 0.0);
        let result = run_stress_test(&dataset, &sample_params(10, 0.0), ymd(2000, 1))
            .expect("valid stress test");

        assert!(!result.failed);
        assert_eq!(result.yearly_values.len(), 6);
        let last = result.yearly_values.last().expect("trailing snapshot");
        assert_eq!(last.label, "Jun 2004");
        assert_eq!(last.year, 2004);
        assert_eq!(result.yearly_values[4].label, "Jan 2004");
    }

    #[test]
    fn history_ending_on_an_anniversary_labels_it_with_the_last_month() {
        // 48 months from the anchor exactly, data ends December 2003.
        let dataset = flat_history(60, 0.0);
        let result = run_stress_test(&dataset, &sample_params(10, 0.0), ymd(2000, 1))
            .expect("valid stress test");

        let labels: Vec<_> = result.yearly_values.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(
            labels,
            ["Jan 2000", "Jan 2001", "Jan 2002", "Jan 2003", "Dec 2003"]
        );
        assert_eq!(result.yearly_values[4].year, 2003);
    }

    #[test]
    fn horizon_ending_with_the_data_stays_inside_it() {
        let dataset = flat_history(48, 0.0);
        let result = run_stress_test(&dataset, &sample_params(3, 0.04), ymd(2000, 1))
            .expect("valid stress test");

        assert_eq!(result.yearly_values.len(), 4);
        let last = result.yearly_values.last().expect("snapshot");
        assert_eq!(last.label, "Dec 2002");
        assert_approx(last.value, PRINCIPAL - 3.0 * 40_000.0);
    }

    #[test]
    fn labels_are_unique_and_inside_the_data() {
        for months in 12..=40 {
            let dataset = flat_history(12 + months, 0.0);
            let result = run_stress_test(&dataset, &sample_params(10, 0.0), ymd(2000, 1))
                .expect("valid stress test");
            let last_month = dataset.last_month().expect("dated");

            let mut labels: Vec<_> = result.yearly_values.iter().map(|s| &s.label).collect();
            assert_eq!(labels.last().map(|l| l.as_str()), Some(month_label(last_month).as_str()));
            labels.dedup();
            assert_eq!(labels.len(), result.yearly_values.len(), "{months} months");
        }
    }

    #[test]
    fn less_than_a_year_from_the_anchor_is_data_unavailable() {
        let dataset = flat_history(24, 0.0);
        for anchor in [ymd(2000, 12), ymd(2000, 7)] {
            let err = run_stress_test(&dataset, &sample_params(1, 0.04), anchor)
                .expect_err("short slice");
            assert!(matches!(err, CoreError::DataUnavailable(_)));
        }
        assert!(run_stress_test(&dataset, &sample_params(1, 0.04), ymd(2000, 1)).is_ok());
    }

    #[test]
    fn failure_stops_replay_and_reports_calendar_year() {
        let dataset = flat_history(120, 0.0);
        let mut params = sample_params(8, 0.6);
        params.allocation = Allocation::new(1.0, 0.0);

        let result = run_stress_test(&dataset, &params, ymd(2000, 1)).expect("valid");
        assert!(result.failed);
        // 50,000 a month exhausts 1,000,000 in the 20th month: August 2001.
        assert_eq!(result.failure_year, Some(2001));
        assert_eq!(result.yearly_values.len(), 2);
        assert_eq!(result.yearly_values[1].label, "Jan 2001");
        assert_approx(result.yearly_values[1].value, 400_000.0);
    }

    #[test]
    fn fixed_inflation_setting_is_ignored() {
        let dataset = flat_history(120, 0.004);
        let bootstrap = sample_params(5, 0.05);
        let mut fixed = bootstrap;
        fixed.fixed_annual_inflation = Some(0.10);

        let a = run_stress_test(&dataset, &bootstrap, ymd(2000, 1)).expect("valid");
        let b = run_stress_test(&dataset, &fixed, ymd(2000, 1)).expect("valid");
        assert_eq!(a, b);
    }

    #[test]
    fn withdrawals_escalate_with_the_slices_inflation() {
        let dataset = flat_history(60, 0.01);
        let result = run_stress_test(&dataset, &sample_params(2, 0.12), ymd(2000, 1))
            .expect("valid");

        let escalated = 10_000.0 * 1.01_f64.powi(12);
        let expected = PRINCIPAL - 120_000.0 - 12.0 * escalated;
        assert!((result.yearly_values[2].value - expected).abs() < 1e-4);
    }

    #[test]
    fn replay_follows_chronological_order() {
        let mut rows = vec![MonthlyObservation::new(0.0, 0.0, 0.0); 36];
        // Anchor is row 12 (January 2000): a 50% equity crash that month.
        rows[12] = MonthlyObservation::new(-0.5, 0.0, 0.0);
        let dataset = HistoricalDataset::dated_from(ymd(1999, 1), rows).expect("dataset");
        let mut params = sample_params(1, 0.0);
        params.allocation = Allocation::new(1.0, 0.0);

        let result = run_stress_test(&dataset, &params, ymd(2000, 1)).expect("valid");
        assert_approx(result.yearly_values[1].value, 500_000.0);
    }

    #[test]
    fn repeated_runs_are_bit_identical() {
        let rows = (0..240)
            .map(|i| {
                let wobble = ((i * 37) % 11) as f64 / 100.0 - 0.05;
                MonthlyObservation::new(wobble, wobble / 5.0, 0.002)
            })
            .collect();
        let dataset = HistoricalDataset::dated_from(ymd(1995, 1), rows).expect("dataset");
        let params = sample_params(12, 0.045);

        let a = run_stress_test(&dataset, &params, ymd(2000, 1)).expect("valid");
        let b = run_stress_test(&dataset, &params, ymd(2000, 1)).expect("valid");
        assert_eq!(a, b);
        for (x, y) in a.yearly_values.iter().zip(&b.yearly_values) {
            assert_eq!(x.value.to_bits(), y.value.to_bits());
        }
    }

    #[test]
    fn missing_anchor_or_dates_is_data_unavailable() {
        let dataset = flat_history(24, 0.0);
        let err = run_stress_test(&dataset, &sample_params(1, 0.04), ymd(2010, 1))
            .expect_err("anchor outside data");
        assert!(matches!(err, CoreError::DataUnavailable(_)));

        let undated = HistoricalDataset::new(vec![MonthlyObservation::new(0.0, 0.0, 0.0); 24])
            .expect("dataset");
        let err = run_stress_test(&undated, &sample_params(1, 0.04), ymd(2000, 1))
            .expect_err("no dates");
        assert!(matches!(err, CoreError::DataUnavailable(_)));
    }

    #[test]
    fn anchor_day_is_normalised_to_month() {
        let dataset = flat_history(36, 0.0);
        let result = run_stress_test(
            &dataset,
            &sample_params(1, 0.0),
            NaiveDate::from_ymd_opt(2000, 1, 31).expect("date"),
        )
        .expect("valid");
        assert_eq!(result.start_label, "Jan 2000");
    }
}
