use crate::backtest::ledger::TradeRecord;
use crate::error::SimulationError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;

/// Aggregate performance of one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    // Capital
    pub initial_capital: f64,
    pub final_capital: f64,
    pub net_profit_total: f64,
    pub return_pct: f64,

    // Trade Statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,

    // P&L Distribution
    pub total_profit: f64,
    /// Sum of |netProfit| over losing trades
    pub total_loss: f64,
    /// +inf when there are profits and no losses
    #[serde(
        serialize_with = "serialize_profit_factor",
        deserialize_with = "deserialize_profit_factor"
    )]
    pub profit_factor: f64,
    pub average_win: f64,
    /// Mean netProfit of losing trades (negative)
    pub average_loss: f64,

    // Risk Metrics
    pub max_drawdown_pct: f64,
    /// Per-trade returns annualised with sqrt(252); assumes one trade per day
    pub sharpe_ratio_approx: f64,
}

impl Metrics {
    /// Calculate metrics from a completed ledger
    pub fn from_ledger(ledger: &[TradeRecord], initial_capital: f64, final_capital: f64) -> Self {
        let total_trades = ledger.len();

        if total_trades == 0 {
            return Self::empty(initial_capital, final_capital);
        }

        let return_pct = if initial_capital > 0.0 {
            (final_capital / initial_capital - 1.0) * 100.0
        } else {
            0.0
        };

        // Win/Loss statistics
        let wins: Vec<f64> = ledger
            .iter()
            .map(|t| t.net_profit)
            .filter(|p| *p > 0.0)
            .collect();
        let losses: Vec<f64> = ledger
            .iter()
            .map(|t| t.net_profit)
            .filter(|p| *p < 0.0)
            .collect();

        let win_rate = (wins.len() as f64 / total_trades as f64) * 100.0;

        let total_profit: f64 = wins.iter().sum();
        let total_loss: f64 = losses.iter().map(|p| p.abs()).sum();

        let average_win = mean(&wins).unwrap_or(0.0);
        let average_loss = mean(&losses).unwrap_or(0.0);

        // Profit factor
        let profit_factor = if total_loss > 0.0 {
            total_profit / total_loss
        } else if total_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let max_drawdown_pct = Self::calculate_drawdown_pct(ledger, initial_capital);
        let sharpe_ratio_approx = Self::calculate_sharpe_ratio(ledger, initial_capital);

        Self {
            initial_capital,
            final_capital,
            net_profit_total: ledger.iter().map(|t| t.net_profit).sum(),
            return_pct,
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            total_profit,
            total_loss,
            profit_factor,
            average_win,
            average_loss,
            max_drawdown_pct,
            sharpe_ratio_approx,
        }
    }

    /// Empty metrics for when no trades occurred
    fn empty(initial_capital: f64, final_capital: f64) -> Self {
        Self {
            initial_capital,
            final_capital,
            net_profit_total: 0.0,
            return_pct: 0.0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            total_profit: 0.0,
            total_loss: 0.0,
            profit_factor: 0.0,
            average_win: 0.0,
            average_loss: 0.0,
            max_drawdown_pct: 0.0,
            sharpe_ratio_approx: 0.0,
        }
    }

    /// Largest peak-to-trough drop of the equity curve, in percent of the peak
    fn calculate_drawdown_pct(ledger: &[TradeRecord], initial_capital: f64) -> f64 {
        let equity = std::iter::once(initial_capital).chain(ledger.iter().map(|t| t.capital_after));

        let mut peak = f64::NEG_INFINITY;
        let mut max_dd_pct: f64 = 0.0;

        for value in equity {
            if value > peak {
                peak = value;
            }
            if peak > 0.0 {
                max_dd_pct = max_dd_pct.max((peak - value) / peak * 100.0);
            }
        }

        max_dd_pct
    }

    /// mean / sample std of per-trade returns, times sqrt(252)
    ///
    /// Each trade's return is its net profit over the capital before it.
    fn calculate_sharpe_ratio(ledger: &[TradeRecord], initial_capital: f64) -> f64 {
        if ledger.len() < 2 {
            return 0.0;
        }

        let mut previous = initial_capital;
        let returns: Vec<f64> = ledger
            .iter()
            .map(|t| {
                let r = if previous != 0.0 { t.net_profit / previous } else { 0.0 };
                previous = t.capital_after;
                r
            })
            .collect();

        let mean_return = returns.iter().sum::<f64>() / returns.len() as f64;

        let variance = returns
            .iter()
            .map(|r| {
                let diff = r - mean_return;
                diff * diff
            })
            .sum::<f64>()
            / (returns.len() - 1) as f64;

        let std_dev = variance.sqrt();

        if std_dev > 0.0 {
            mean_return / std_dev * 252f64.sqrt()
        } else {
            0.0
        }
    }

    pub fn to_json(&self) -> Result<String, SimulationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), SimulationError> {
        std::fs::write(path.as_ref(), self.to_json()?)?;
        tracing::info!("Wrote metrics to {}", path.as_ref().display());
        Ok(())
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║             SIMULATION PERFORMANCE REPORT             ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        println!("📊 CAPITAL");
        println!("  Initial Capital:       ${:.2}", self.initial_capital);
        println!("  Final Capital:         ${:.2}", self.final_capital);
        println!(
            "  Net P&L:               ${:.2} ({:+.2}%)",
            self.net_profit_total, self.return_pct
        );

        println!("\n📈 TRADE STATISTICS");
        println!("  Total Trades:          {}", self.total_trades);
        println!(
            "  Winning Trades:        {} ({:.1}%)",
            self.winning_trades, self.win_rate
        );
        println!("  Losing Trades:         {}", self.losing_trades);

        if self.total_trades > 0 {
            println!("\n💰 WIN/LOSS ANALYSIS");
            println!("  Total Profit:          ${:.2}", self.total_profit);
            println!("  Total Loss:            ${:.2}", self.total_loss);
            println!("  Average Win:           ${:.2}", self.average_win);
            println!("  Average Loss:          ${:.2}", self.average_loss);
            println!("  Profit Factor:         {:.2}", self.profit_factor);

            println!("\n⚠️  RISK METRICS");
            println!("  Max Drawdown:          {:.2}%", self.max_drawdown_pct);
            println!("  Sharpe Ratio (approx): {:.2}", self.sharpe_ratio_approx);
        }

        println!("\n═════════════════════════════════════════════════════════\n");
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

// JSON has no infinity literal
fn serialize_profit_factor<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_infinite() {
        serializer.serialize_str("Infinity")
    } else {
        serializer.serialize_f64(*value)
    }
}

fn deserialize_profit_factor<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Number(v) => Ok(v),
        Repr::Text(s) if s == "Infinity" => Ok(f64::INFINITY),
        Repr::Text(s) => Err(serde::de::Error::custom(format!("invalid profit factor '{}'", s))),
    }
}
