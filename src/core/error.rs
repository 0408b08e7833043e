use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("historical data unavailable: {0}")]
    DataUnavailable(String),
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("failed to read historical data file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse historical data csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column `{0}`")]
    MissingColumn(&'static str),
    #[error("line {line}: {message}")]
    Row { line: u64, message: String },
    #[error("historical data file contains no rows")]
    Empty,
    #[error(transparent)]
    Invalid(#[from] CoreError),
}
