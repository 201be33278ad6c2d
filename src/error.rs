use crate::models::StreamKey;

/// Errors that reject a simulation run before any row is processed, plus
/// table loading and ledger export failures
#[derive(thiserror::Error, Debug)]
pub enum SimulationError {
    /// A required column is absent from the price table.
    #[error("Price table is missing required column '{0}'")]
    MissingColumn(&'static str),

    /// Table columns disagree in length.
    #[error("Column '{column}' has {actual} rows, expected {expected}")]
    ColumnLength {
        column: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The prediction series is not row-aligned with the price table.
    #[error("Price table has {table} rows but {predictions} predictions were given")]
    LengthMismatch { table: usize, predictions: usize },

    /// A parameter lies outside its accepted range.
    #[error("Invalid parameter {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// A table cell could not be parsed.
    #[error("Row {row}: cannot parse {column} value '{value}'")]
    Parse {
        row: usize,
        column: &'static str,
        value: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the live stream registry
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    /// Neither the historical backfill nor the live feed could be reached.
    #[error("Could not connect stream {key}: backfill failed ({backfill}), live attach failed ({live})")]
    Connection {
        key: StreamKey,
        backfill: String,
        live: String,
    },

    #[error("Stream {0} is not open")]
    UnknownStream(StreamKey),

    #[error("Stream {0} is already open")]
    AlreadyOpen(StreamKey),

    #[error("max_len must be at least 1 (stream {0})")]
    ZeroCapacity(StreamKey),
}
