use crate::error::SimulationError;
use crate::models::Candle;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::io::Read;
use std::path::Path;

/// Column-oriented price series fed to the simulator
///
/// Every column has one entry per row. `high`/`low` drive TP/SL checks and
/// default to `close` when a source has no intrabar range. A missing ATR is
/// stored as `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    open_time: Vec<DateTime<Utc>>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    atr: Vec<Option<f64>>,
}

fn check_len(column: &'static str, expected: usize, actual: usize) -> Result<(), SimulationError> {
    if expected != actual {
        return Err(SimulationError::ColumnLength {
            column,
            expected,
            actual,
        });
    }
    Ok(())
}

impl PriceTable {
    pub fn new(
        open_time: Vec<DateTime<Utc>>,
        close: Vec<f64>,
        atr: Vec<Option<f64>>,
    ) -> Result<Self, SimulationError> {
        let rows = open_time.len();
        check_len("close", rows, close.len())?;
        check_len("atr", rows, atr.len())?;

        Ok(Self {
            open_time,
            high: close.clone(),
            low: close.clone(),
            close,
            atr,
        })
    }

    /// Replace the intrabar range columns
    pub fn with_high_low(mut self, high: Vec<f64>, low: Vec<f64>) -> Result<Self, SimulationError> {
        check_len("high", self.len(), high.len())?;
        check_len("low", self.len(), low.len())?;
        self.high = high;
        self.low = low;
        Ok(self)
    }

    /// Build from closed candles, taking the ATR already stored on each candle
    pub fn from_candles(candles: &[Candle]) -> Self {
        Self {
            open_time: candles.iter().map(|c| c.open_time).collect(),
            high: candles.iter().map(|c| c.high).collect(),
            low: candles.iter().map(|c| c.low).collect(),
            close: candles.iter().map(|c| c.close).collect(),
            atr: candles.iter().map(|c| c.atr).collect(),
        }
    }

    /// Load `open_time,[open,]high?,low?,close,atr` from a CSV file
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self, SimulationError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, SimulationError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
        };

        let time_idx = find("open_time").ok_or(SimulationError::MissingColumn("open_time"))?;
        let close_idx = find("close").ok_or(SimulationError::MissingColumn("close"))?;
        let atr_idx = find("atr").ok_or(SimulationError::MissingColumn("atr"))?;
        let high_idx = find("high");
        let low_idx = find("low");

        let mut table = Self {
            open_time: Vec::new(),
            high: Vec::new(),
            low: Vec::new(),
            close: Vec::new(),
            atr: Vec::new(),
        };

        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let cell = |idx: usize| record.get(idx).unwrap_or("");

            let open_time = parse_time(cell(time_idx)).ok_or_else(|| SimulationError::Parse {
                row,
                column: "open_time",
                value: cell(time_idx).to_string(),
            })?;
            let close = parse_number(row, "close", cell(close_idx))?.unwrap_or(f64::NAN);
            let atr = parse_number(row, "atr", cell(atr_idx))?.filter(|v| v.is_finite());
            let high = match high_idx {
                Some(idx) => parse_number(row, "high", cell(idx))?.unwrap_or(close),
                None => close,
            };
            let low = match low_idx {
                Some(idx) => parse_number(row, "low", cell(idx))?.unwrap_or(close),
                None => close,
            };

            table.open_time.push(open_time);
            table.close.push(close);
            table.high.push(high);
            table.low.push(low);
            table.atr.push(atr);
        }

        tracing::debug!("Loaded price table with {} rows", table.len());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.open_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open_time.is_empty()
    }

    pub fn open_times(&self) -> &[DateTime<Utc>] {
        &self.open_time
    }

    pub fn closes(&self) -> &[f64] {
        &self.close
    }

    pub fn highs(&self) -> &[f64] {
        &self.high
    }

    pub fn lows(&self) -> &[f64] {
        &self.low
    }

    pub fn atrs(&self) -> &[Option<f64>] {
        &self.atr
    }

    /// Intrabar `(high, low)` for a row, falling back to the close when a bound
    /// is not a number. None when nothing usable is left.
    pub fn bar_range(&self, row: usize) -> Option<(f64, f64)> {
        let close = self.close[row];
        let pick = |v: f64| {
            if v.is_finite() {
                Some(v)
            } else if close.is_finite() {
                Some(close)
            } else {
                None
            }
        };
        Some((pick(self.high[row])?, pick(self.low[row])?))
    }

    /// Close and ATR for a row if both are usable for an entry
    pub fn entry_inputs(&self, row: usize) -> Option<(f64, f64)> {
        let close = self.close[row];
        let atr = self.atr[row]?;
        if close.is_finite() && close > 0.0 && atr.is_finite() && atr > 0.0 {
            Some((close, atr))
        } else {
            None
        }
    }

    /// Latest close at or before `row` that is a positive number
    pub fn last_valid_close(&self, row: usize) -> Option<f64> {
        self.close[..=row]
            .iter()
            .rev()
            .copied()
            .find(|c| c.is_finite() && *c > 0.0)
    }
}

/// Accepts epoch milliseconds, RFC3339, or `YYYY-MM-DD HH:MM:SS[.fff]` (taken as UTC)
fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ms) = value.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_number(row: usize, column: &'static str, value: &str) -> Result<Option<f64>, SimulationError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<f64>()
        .map(Some)
        .map_err(|_| SimulationError::Parse {
            row,
            column,
            value: value.to_string(),
        })
}

/// Read a prediction series: a `prediction` column, or the only column present
pub fn load_predictions(path: impl AsRef<Path>) -> Result<Vec<f64>, SimulationError> {
    let file = std::fs::File::open(path)?;
    read_predictions(file)
}

pub fn read_predictions<R: Read>(reader: R) -> Result<Vec<f64>, SimulationError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let idx = match headers.iter().position(|h| h.eq_ignore_ascii_case("prediction")) {
        Some(idx) => idx,
        None if headers.len() == 1 => 0,
        None => return Err(SimulationError::MissingColumn("prediction")),
    };

    let mut predictions = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record?;
        let value = parse_number(row, "prediction", record.get(idx).unwrap_or(""))?;
        predictions.push(value.unwrap_or(f64::NAN));
    }
    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_rejects_ragged_columns() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = PriceTable::new(vec![t0, t0], vec![1.0], vec![None, None]).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::ColumnLength { column: "close", expected: 2, actual: 1 }
        ));
    }

    #[test]
    fn test_from_csv_defaults_high_low_to_close() {
        let data = "open_time,close,atr\n\
                    2024-01-01T00:00:00Z,100.0,\n\
                    1704067260000,101.5,NaN\n\
                    2024-01-01 00:02:00,102.0,1.25\n";
        let table = PriceTable::from_reader(data.as_bytes()).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.highs(), table.closes());
        assert_eq!(table.lows(), table.closes());
        assert_eq!(table.atrs(), &[None, None, Some(1.25)]);
        assert_eq!(
            table.open_times()[1],
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap()
        );
    }

    #[test]
    fn test_from_csv_reads_range_and_uppercase_atr() {
        let data = "open_time,open,high,low,close,ATR\n\
                    2024-01-01T00:00:00Z,99,104,97,100,2\n";
        let table = PriceTable::from_reader(data.as_bytes()).unwrap();

        assert_eq!(table.bar_range(0), Some((104.0, 97.0)));
        assert_eq!(table.entry_inputs(0), Some((100.0, 2.0)));
    }

    #[test]
    fn test_from_csv_missing_column() {
        let data = "open_time,close\n2024-01-01T00:00:00Z,100\n";
        let err = PriceTable::from_reader(data.as_bytes()).unwrap_err();
        assert!(matches!(err, SimulationError::MissingColumn("atr")));
    }

    #[test]
    fn test_from_csv_bad_cell() {
        let data = "open_time,close,atr\n2024-01-01T00:00:00Z,abc,1\n";
        let err = PriceTable::from_reader(data.as_bytes()).unwrap_err();
        assert!(matches!(err, SimulationError::Parse { row: 0, column: "close", .. }));
    }

    #[test]
    fn test_entry_inputs_rejects_invalid_rows() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let table = PriceTable::new(
            vec![t0; 4],
            vec![100.0, f64::NAN, -1.0, 100.0],
            vec![Some(1.0), Some(1.0), Some(1.0), Some(0.0)],
        )
        .unwrap();

        assert!(table.entry_inputs(0).is_some());
        assert!(table.entry_inputs(1).is_none());
        assert!(table.entry_inputs(2).is_none());
        assert!(table.entry_inputs(3).is_none());
        assert_eq!(table.last_valid_close(2), Some(100.0));
    }

    #[test]
    fn test_read_predictions() {
        let preds = read_predictions("prediction\n0.001\n-0.002\n".as_bytes()).unwrap();
        assert_eq!(preds, vec![0.001, -0.002]);

        let preds = read_predictions("pred\n0.5\n".as_bytes()).unwrap();
        assert_eq!(preds, vec![0.5]);

        assert!(read_predictions("a,b\n1,2\n".as_bytes()).is_err());
    }
}
