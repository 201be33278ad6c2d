use crate::error::SimulationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "SL")]
    StopLoss,
    /// Position still open when the price series ran out
    #[serde(rename = "end of data")]
    EndOfData,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "TP"),
            ExitReason::StopLoss => write!(f, "SL"),
            ExitReason::EndOfData => write!(f, "end of data"),
        }
    }
}

/// One completed trade. Field order is the export column order.
///
/// Prices, quantity and ATR carry 8 decimals, currency amounts 2, the
/// predicted return 6.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub allocated_value: f64,
    pub quantity: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub gross_profit: f64,
    pub total_cost: f64,
    pub net_profit: f64,
    pub capital_after: f64,
    pub predicted_return: f64,
    pub exit_reason: ExitReason,
    pub entry_atr: f64,
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Write the ledger as CSV with a header row
pub fn write_ledger<W: Write>(writer: W, ledger: &[TradeRecord]) -> Result<(), SimulationError> {
    let mut wtr = csv::Writer::from_writer(writer);
    if ledger.is_empty() {
        // serde only emits headers alongside the first record
        wtr.write_record(LEDGER_COLUMNS)?;
    }
    for record in ledger {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_ledger_csv(path: impl AsRef<Path>, ledger: &[TradeRecord]) -> Result<(), SimulationError> {
    let file = std::fs::File::create(path.as_ref())?;
    write_ledger(file, ledger)?;
    tracing::info!("Wrote {} trades to {}", ledger.len(), path.as_ref().display());
    Ok(())
}

pub fn read_ledger_csv(path: impl AsRef<Path>) -> Result<Vec<TradeRecord>, SimulationError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let ledger = rdr.deserialize().collect::<Result<Vec<TradeRecord>, _>>()?;
    Ok(ledger)
}

pub const LEDGER_COLUMNS: [&str; 16] = [
    "entryTime",
    "exitTime",
    "direction",
    "entryPrice",
    "exitPrice",
    "allocatedValue",
    "quantity",
    "takeProfitPrice",
    "stopLossPrice",
    "grossProfit",
    "totalCost",
    "netProfit",
    "capitalAfter",
    "predictedReturn",
    "exitReason",
    "entryAtr",
];
