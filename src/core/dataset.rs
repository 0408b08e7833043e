//! Historical monthly return data.
//!
//! The on-disk format is the CSV produced by the data pipeline: one row per
//! calendar month with equity total return, intermediate treasury total
//! return and CPI month-over-month inflation, all in percent. Values are
//! converted to decimals on load; nothing downstream sees percent.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate};
use csv::StringRecord;

use super::error::{CoreError, DatasetError};
use super::types::MonthlyObservation;

const DATE_COLUMNS: &[&str] = &["date"];
const EQUITY_COLUMNS: &[&str] = &["sp500_total_return", "sp500_return"];
const BOND_COLUMNS: &[&str] = &["treasury_5y_total_return", "treasury_5y_return"];
const INFLATION_COLUMNS: &[&str] = &["inflation_monthly", "cpi_monthly"];

/// Immutable, chronologically ordered monthly observations. Cloning shares
/// the underlying rows.
#[derive(Debug, Clone)]
pub struct HistoricalDataset {
    observations: Arc<[MonthlyObservation]>,
}

impl HistoricalDataset {
    pub fn new(observations: Vec<MonthlyObservation>) -> Result<Self, CoreError> {
        if observations.is_empty() {
            return Err(CoreError::DataUnavailable(
                "historical dataset is empty".to_string(),
            ));
        }
        check_consecutive_months(&observations)?;
        Ok(Self {
            observations: observations.into(),
        })
    }

    /// Stamps `rows` with consecutive calendar months starting at `start`.
    pub fn dated_from(start: NaiveDate, rows: Vec<MonthlyObservation>) -> Result<Self, CoreError> {
        let start = first_of_month(start);
        let mut dated = Vec::with_capacity(rows.len());
        for (offset, row) in rows.into_iter().enumerate() {
            let month = start
                .checked_add_months(Months::new(offset as u32))
                .ok_or_else(|| CoreError::DataUnavailable("calendar overflow".to_string()))?;
            dated.push(row.dated(month));
        }
        Self::new(dated)
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        let columns = ColumnMap::resolve(&headers)?;

        let mut observations = Vec::new();
        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            observations.push(columns.parse_row(&record, line)?);
        }

        if observations.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Self::new(observations)?)
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[MonthlyObservation] {
        &self.observations
    }

    pub fn get(&self, index: usize) -> Option<&MonthlyObservation> {
        self.observations.get(index)
    }

    pub fn first_month(&self) -> Option<NaiveDate> {
        self.observations.first().and_then(|o| o.month)
    }

    pub fn last_month(&self) -> Option<NaiveDate> {
        self.observations.last().and_then(|o| o.month)
    }

    /// Index of the row for the calendar month containing `month`.
    pub fn index_of_month(&self, month: NaiveDate) -> Option<usize> {
        let target = first_of_month(month);
        self.observations
            .iter()
            .position(|o| o.month == Some(target))
    }
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Accepts `YYYY-MM-DD` (any day, normalised to the first) or `YYYY-MM`.
pub fn parse_month(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(first_of_month(date));
    }
    NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d").ok()
}

fn check_consecutive_months(observations: &[MonthlyObservation]) -> Result<(), CoreError> {
    let dated = observations.iter().filter(|o| o.month.is_some()).count();
    if dated == 0 {
        return Ok(());
    }
    if dated != observations.len() {
        return Err(CoreError::DataUnavailable(
            "historical dataset mixes dated and undated rows".to_string(),
        ));
    }

    for pair in observations.windows(2) {
        let (Some(prev), Some(next)) = (pair[0].month, pair[1].month) else {
            continue;
        };
        if prev.checked_add_months(Months::new(1)) != Some(next) {
            return Err(CoreError::DataUnavailable(format!(
                "historical months are not consecutive: {} is followed by {}",
                prev.format("%Y-%m"),
                next.format("%Y-%m")
            )));
        }
    }
    Ok(())
}

struct ColumnMap {
    date: Option<usize>,
    equity: usize,
    bond: usize,
    inflation: usize,
}

impl ColumnMap {
    fn resolve(headers: &StringRecord) -> Result<Self, DatasetError> {
        let by_name: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (normalize_header_name(name), idx))
            .collect();
        let find = |aliases: &[&str]| aliases.iter().find_map(|a| by_name.get(*a).copied());

        Ok(Self {
            date: find(DATE_COLUMNS),
            equity: find(EQUITY_COLUMNS).ok_or(DatasetError::MissingColumn(EQUITY_COLUMNS[0]))?,
            bond: find(BOND_COLUMNS).ok_or(DatasetError::MissingColumn(BOND_COLUMNS[0]))?,
            inflation: find(INFLATION_COLUMNS)
                .ok_or(DatasetError::MissingColumn(INFLATION_COLUMNS[0]))?,
        })
    }

    fn parse_row(&self, record: &StringRecord, line: u64) -> Result<MonthlyObservation, DatasetError> {
        let percent = |idx: usize, name: &str| -> Result<f64, DatasetError> {
            let raw = record.get(idx).unwrap_or("").trim();
            if raw.is_empty() {
                return Err(DatasetError::Row {
                    line,
                    message: format!("{name} is blank"),
                });
            }
            let value = raw.parse::<f64>().map_err(|_| DatasetError::Row {
                line,
                message: format!("{name} is not a number: {raw:?}"),
            })?;
            if !value.is_finite() {
                return Err(DatasetError::Row {
                    line,
                    message: format!("{name} is not finite"),
                });
            }
            Ok(value / 100.0)
        };

        let mut observation = MonthlyObservation::new(
            percent(self.equity, "equity return")?,
            percent(self.bond, "bond return")?,
            percent(self.inflation, "inflation")?,
        );

        if let Some(idx) = self.date {
            let raw = record.get(idx).unwrap_or("");
            let month = parse_month(raw).ok_or_else(|| DatasetError::Row {
                line,
                message: format!("unrecognised date {raw:?}"),
            })?;
            observation = observation.dated(month);
        }
        Ok(observation)
    }
}

fn normalize_header_name(name: &str) -> String {
    name.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Date,SP500_Total_Return,Treasury_5Y_Total_Return,Inflation_Monthly
1999-11-30,2.0,0.5,0.1
1999-12-31,5.9,-0.3,0.2
2000-01-31,-5.0,0.4,0.3
";

    #[test]
    fn csv_rows_are_converted_from_percent_to_decimal() {
        let dataset = HistoricalDataset::from_reader(SAMPLE.as_bytes()).expect("valid csv");
        assert_eq!(dataset.len(), 3);

        let jan = dataset.get(2).expect("third row");
        assert!((jan.equity_return - -0.05).abs() < 1e-12);
        assert!((jan.bond_return - 0.004).abs() < 1e-12);
        assert!((jan.inflation - 0.003).abs() < 1e-12);
        assert_eq!(jan.month, NaiveDate::from_ymd_opt(2000, 1, 1));
    }

    #[test]
    fn csv_accepts_pipeline_column_aliases_and_bom() {
        let csv = "\u{feff}Date,SP500_Return,Treasury_5Y_Return,CPI_Monthly\n2001-03,1,1,1\n";
        let dataset = HistoricalDataset::from_reader(csv.as_bytes()).expect("aliases accepted");
        assert_eq!(dataset.first_month(), NaiveDate::from_ymd_opt(2001, 3, 1));
    }

    #[test]
    fn csv_without_date_column_loads_undated_rows() {
        let csv = "SP500_Total_Return,Treasury_5Y_Total_Return,Inflation_Monthly\n1,2,3\n";
        let dataset = HistoricalDataset::from_reader(csv.as_bytes()).expect("valid csv");
        assert_eq!(dataset.first_month(), None);
    }

    #[test]
    fn csv_rejects_missing_column() {
        let csv = "Date,SP500_Total_Return,Inflation_Monthly\n2000-01-31,1,1\n";
        let err = HistoricalDataset::from_reader(csv.as_bytes()).expect_err("bond column missing");
        assert!(matches!(err, DatasetError::MissingColumn("treasury_5y_total_return")));
    }

    #[test]
    fn csv_rejects_blank_field_with_line_number() {
        let csv = "Date,SP500_Total_Return,Treasury_5Y_Total_Return,Inflation_Monthly\n\
2000-01-31,1,1,1\n2000-02-29,1,,1\n";
        let err = HistoricalDataset::from_reader(csv.as_bytes()).expect_err("blank bond field");
        match err {
            DatasetError::Row { line, message } => {
                assert_eq!(line, 3);
                assert!(message.contains("bond return"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn csv_with_only_header_is_empty() {
        let csv = "Date,SP500_Total_Return,Treasury_5Y_Total_Return,Inflation_Monthly\n";
        let err = HistoricalDataset::from_reader(csv.as_bytes()).expect_err("no rows");
        assert!(matches!(err, DatasetError::Empty));
    }

    #[test]
    fn gaps_in_months_are_rejected() {
        let jan = NaiveDate::from_ymd_opt(2000, 1, 1).expect("date");
        let mar = NaiveDate::from_ymd_opt(2000, 3, 1).expect("date");
        let rows = vec![
            MonthlyObservation::new(0.0, 0.0, 0.0).dated(jan),
            MonthlyObservation::new(0.0, 0.0, 0.0).dated(mar),
        ];
        let err = HistoricalDataset::new(rows).expect_err("gap");
        assert!(matches!(err, CoreError::DataUnavailable(_)));
    }

    #[test]
    fn empty_dataset_is_unavailable() {
        let err = HistoricalDataset::new(Vec::new()).expect_err("empty");
        assert!(matches!(err, CoreError::DataUnavailable(_)));
    }

    #[test]
    fn dated_from_stamps_consecutive_months_across_year_end() {
        let start = NaiveDate::from_ymd_opt(1999, 11, 15).expect("date");
        let rows = vec![MonthlyObservation::new(0.0, 0.0, 0.0); 4];
        let dataset = HistoricalDataset::dated_from(start, rows).expect("valid");
        assert_eq!(dataset.first_month(), NaiveDate::from_ymd_opt(1999, 11, 1));
        assert_eq!(dataset.last_month(), NaiveDate::from_ymd_opt(2000, 2, 1));
        assert_eq!(
            dataset.index_of_month(NaiveDate::from_ymd_opt(2000, 1, 20).expect("date")),
            Some(2)
        );
    }

    #[test]
    fn parse_month_accepts_both_formats() {
        let expected = NaiveDate::from_ymd_opt(2008, 10, 1);
        assert_eq!(parse_month("2008-10"), expected);
        assert_eq!(parse_month("2008-10-31"), expected);
        assert_eq!(parse_month("October 2008"), None);
    }
}
