use crate::backtest::ledger::{round_to, Direction, ExitReason, TradeRecord};
use crate::backtest::metrics::Metrics;
use crate::backtest::params::SimulationParams;
use crate::backtest::table::PriceTable;
use crate::error::SimulationError;
use chrono::{DateTime, Utc};

/// The single open position of a run
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub quantity: f64,
    pub allocated_value: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub entry_atr: f64,
    pub predicted_return: f64,
    /// Fee paid at entry, already taken out of capital
    pub entry_cost: f64,
}

impl Position {
    /// Exit level and reason if the bar's range reaches TP or SL.
    ///
    /// TP is checked first. A bar spanning both levels is booked as TP since
    /// OHLC data cannot tell which was touched first.
    pub fn check_exit(&self, high: f64, low: f64) -> Option<(f64, ExitReason)> {
        match self.direction {
            Direction::Long => {
                if high >= self.take_profit_price {
                    Some((self.take_profit_price, ExitReason::TakeProfit))
                } else if low <= self.stop_loss_price {
                    Some((self.stop_loss_price, ExitReason::StopLoss))
                } else {
                    None
                }
            }
            Direction::Short => {
                if low <= self.take_profit_price {
                    Some((self.take_profit_price, ExitReason::TakeProfit))
                } else if high >= self.stop_loss_price {
                    Some((self.stop_loss_price, ExitReason::StopLoss))
                } else {
                    None
                }
            }
        }
    }

    pub fn gross_profit(&self, exit_price: f64) -> f64 {
        (exit_price - self.entry_price) * self.quantity * self.direction.sign()
    }
}

/// Result of one simulation run
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutcome {
    pub ledger: Vec<TradeRecord>,
    pub initial_capital: f64,
    pub final_capital: f64,
    /// The stop-trading guard ended the run early
    pub halted: bool,
    /// Rows passed over while flat because close or ATR was unusable
    pub skipped_rows: usize,
    /// Entry signals dropped because TP or SL came out non-positive
    pub abandoned_entries: usize,
}

impl SimulationOutcome {
    pub fn metrics(&self) -> Metrics {
        Metrics::from_ledger(&self.ledger, self.initial_capital, self.final_capital)
    }
}

struct SimulationState {
    capital: f64,
    position: Option<Position>,
    ledger: Vec<TradeRecord>,
    skipped_rows: usize,
    abandoned_entries: usize,
    halted: bool,
}

impl SimulationState {
    fn new(capital: f64) -> Self {
        Self {
            capital,
            position: None,
            ledger: Vec::new(),
            skipped_rows: 0,
            abandoned_entries: 0,
            halted: false,
        }
    }

    /// Close `position` at `exit_price` and append its record
    fn settle(
        &mut self,
        position: Position,
        exit_time: DateTime<Utc>,
        exit_price: f64,
        exit_reason: ExitReason,
        fee_rate: f64,
    ) {
        let gross_profit = position.gross_profit(exit_price);
        let exit_cost = exit_price * position.quantity * fee_rate;
        let total_cost = position.entry_cost + exit_cost;
        let net_profit = gross_profit - total_cost;

        // entry_cost left capital when the position opened
        self.capital += gross_profit - exit_cost;

        tracing::debug!(
            "Closed {} at {:.8} ({}), net {:.4}, capital {:.4}",
            position.direction,
            exit_price,
            exit_reason,
            net_profit,
            self.capital
        );

        self.ledger.push(TradeRecord {
            entry_time: position.entry_time,
            exit_time,
            direction: position.direction,
            entry_price: round_to(position.entry_price, 8),
            exit_price: round_to(exit_price, 8),
            allocated_value: round_to(position.allocated_value, 2),
            quantity: round_to(position.quantity, 8),
            take_profit_price: round_to(position.take_profit_price, 8),
            stop_loss_price: round_to(position.stop_loss_price, 8),
            gross_profit: round_to(gross_profit, 2),
            total_cost: round_to(total_cost, 2),
            net_profit: round_to(net_profit, 2),
            capital_after: round_to(self.capital, 2),
            predicted_return: round_to(position.predicted_return, 6),
            exit_reason,
            entry_atr: round_to(position.entry_atr, 8),
        });
    }
}

/// Replays a prediction series against a price table, one position at a time
///
/// A run is a pure function of the table, the predictions and the parameters.
#[derive(Debug, Clone)]
pub struct Simulator {
    params: SimulationParams,
}

impl Simulator {
    /// Validates `params` up front so a bad configuration never starts a run
    pub fn new(params: SimulationParams) -> Result<Self, SimulationError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn run(
        &self,
        table: &PriceTable,
        predictions: &[f64],
    ) -> Result<SimulationOutcome, SimulationError> {
        if table.len() != predictions.len() {
            return Err(SimulationError::LengthMismatch {
                table: table.len(),
                predictions: predictions.len(),
            });
        }

        let p = &self.params;
        let stop_level = p.stop_trading_level();
        let mut state = SimulationState::new(p.initial_capital);

        tracing::info!(
            "Simulating {} rows: capital {:.2}, threshold {:.4}%, TP {}x ATR, SL {}x ATR, leverage {}x",
            table.len(),
            p.initial_capital,
            p.threshold_retorno_entrada * 100.0,
            p.atr_multiplier_tp,
            p.atr_multiplier_sl,
            p.leverage
        );

        let times = table.open_times();

        for row in 0..table.len() {
            // OPEN: look for an exit. The entry row itself never gets here.
            if let Some(position) = state.position.take() {
                let exit = table
                    .bar_range(row)
                    .and_then(|(high, low)| position.check_exit(high, low));

                match exit {
                    Some((exit_price, reason)) => {
                        state.settle(position, times[row], exit_price, reason, p.trade_fee_rate);

                        if state.capital <= stop_level {
                            tracing::warn!(
                                "Stop-trading level reached at row {}: capital {:.2} <= {:.2}, halting",
                                row,
                                state.capital,
                                stop_level
                            );
                            state.halted = true;
                            break;
                        }
                    }
                    None => {
                        state.position = Some(position);
                        continue;
                    }
                }
            }

            // FLAT
            let (close, atr) = match table.entry_inputs(row) {
                Some(inputs) => inputs,
                None => {
                    state.skipped_rows += 1;
                    tracing::trace!("Row {}: close or ATR unusable, skipping", row);
                    continue;
                }
            };

            let prediction = predictions[row];
            if !prediction.is_finite()
                || prediction == 0.0
                || prediction.abs() < p.threshold_retorno_entrada
            {
                continue;
            }

            let direction = if prediction > 0.0 {
                Direction::Long
            } else {
                Direction::Short
            };

            let allocated_value = state.capital * p.pct_operacao;
            if allocated_value <= 0.0 {
                continue;
            }

            let sign = direction.sign();
            let take_profit_price = close + sign * p.atr_multiplier_tp * atr;
            let stop_loss_price = close - sign * p.atr_multiplier_sl * atr;

            if take_profit_price <= 0.0 || stop_loss_price <= 0.0 {
                tracing::warn!(
                    "Row {}: {} entry at {:.8} with ATR {:.8} gives TP {:.8} / SL {:.8}, skipping entry",
                    row,
                    direction,
                    close,
                    atr,
                    take_profit_price,
                    stop_loss_price
                );
                state.abandoned_entries += 1;
                continue;
            }

            let entry_cost = allocated_value * p.trade_fee_rate;
            state.capital -= entry_cost;

            tracing::debug!(
                "Row {}: open {} at {:.8}, TP {:.8}, SL {:.8}, prediction {:.6}",
                row,
                direction,
                close,
                take_profit_price,
                stop_loss_price,
                prediction
            );

            state.position = Some(Position {
                direction,
                entry_time: times[row],
                entry_price: close,
                quantity: allocated_value * p.leverage / close,
                allocated_value,
                take_profit_price,
                stop_loss_price,
                entry_atr: atr,
                predicted_return: prediction,
                entry_cost,
            });
        }

        if let Some(position) = state.position.take() {
            let last = table.len() - 1;
            let exit_price = table
                .last_valid_close(last)
                .unwrap_or(position.entry_price);
            tracing::info!("Closing open position at end of data ({:.8})", exit_price);
            state.settle(position, times[last], exit_price, ExitReason::EndOfData, p.trade_fee_rate);
        }

        tracing::info!(
            "Simulation finished: {} trades, final capital {:.2}{}",
            state.ledger.len(),
            state.capital,
            if state.halted { " (halted)" } else { "" }
        );

        Ok(SimulationOutcome {
            ledger: state.ledger,
            initial_capital: p.initial_capital,
            final_capital: state.capital,
            halted: state.halted,
            skipped_rows: state.skipped_rows,
            abandoned_entries: state.abandoned_entries,
        })
    }
}

/// Validate `params` and run once
pub fn simulate(
    table: &PriceTable,
    predictions: &[f64],
    params: SimulationParams,
) -> Result<SimulationOutcome, SimulationError> {
    Simulator::new(params)?.run(table, predictions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn times(n: usize) -> Vec<DateTime<Utc>> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n).map(|i| t0 + chrono::Duration::hours(i as i64)).collect()
    }

    /// Rows of (close, high, low, atr)
    fn table(rows: &[(f64, f64, f64, Option<f64>)]) -> PriceTable {
        PriceTable::new(
            times(rows.len()),
            rows.iter().map(|r| r.0).collect(),
            rows.iter().map(|r| r.3).collect(),
        )
        .unwrap()
        .with_high_low(
            rows.iter().map(|r| r.1).collect(),
            rows.iter().map(|r| r.2).collect(),
        )
        .unwrap()
    }

    fn scenario_params() -> SimulationParams {
        SimulationParams {
            initial_capital: 100.0,
            leverage: 1.0,
            pct_operacao: 0.5,
            threshold_retorno_entrada: 0.0005,
            trade_fee_rate: 0.0,
            atr_multiplier_tp: 3.0,
            atr_multiplier_sl: 2.0,
            stop_trading_loss_pct: 0.5,
        }
    }

    #[test]
    fn test_no_trade_below_threshold() {
        let params = SimulationParams {
            threshold_retorno_entrada: 0.01,
            ..scenario_params()
        };
        let t = table(&[(100.0, 101.0, 99.0, Some(1.0)); 10]);
        let outcome = simulate(&t, &[0.001; 10], params).unwrap();

        assert!(outcome.ledger.is_empty());
        assert_eq!(outcome.final_capital, 100.0);
        assert!(!outcome.halted);
    }

    #[test]
    fn test_take_profit_hit() {
        let t = table(&[(100.0, 100.0, 100.0, Some(1.0)), (102.0, 104.0, 101.0, Some(1.0))]);
        let outcome = simulate(&t, &[0.002, 0.0], scenario_params()).unwrap();

        assert_eq!(outcome.ledger.len(), 1);
        let trade = &outcome.ledger[0];
        assert_eq!(trade.direction, Direction::Long);
        assert_eq!(trade.entry_price, 100.0);
        assert_eq!(trade.take_profit_price, 103.0);
        assert_eq!(trade.stop_loss_price, 98.0);
        assert_eq!(trade.exit_price, 103.0);
        assert_eq!(trade.quantity, 0.5);
        assert_eq!(trade.gross_profit, 1.5);
        assert_eq!(trade.net_profit, 1.5);
        assert_eq!(trade.capital_after, 101.5);
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(outcome.final_capital, 101.5);
    }

    #[test]
    fn test_stop_loss_hit() {
        let t = table(&[(100.0, 100.0, 100.0, Some(1.0)), (99.0, 100.5, 97.0, Some(1.0))]);
        let outcome = simulate(&t, &[0.002, 0.0], scenario_params()).unwrap();

        let trade = &outcome.ledger[0];
        assert_eq!(trade.exit_price, 98.0);
        assert_eq!(trade.gross_profit, -1.0);
        assert_eq!(trade.net_profit, -1.0);
        assert_eq!(trade.capital_after, 99.0);
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
    }

    #[test]
    fn test_take_profit_wins_when_bar_spans_both_levels() {
        let t = table(&[(100.0, 100.0, 100.0, Some(1.0)), (100.0, 110.0, 90.0, Some(1.0))]);
        let outcome = simulate(&t, &[0.002, 0.0], scenario_params()).unwrap();
        assert_eq!(outcome.ledger[0].exit_reason, ExitReason::TakeProfit);

        let outcome = simulate(&t, &[-0.002, 0.0], scenario_params()).unwrap();
        let trade = &outcome.ledger[0];
        assert_eq!(trade.direction, Direction::Short);
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(trade.exit_price, 97.0);
        assert_eq!(trade.gross_profit, 1.5);
    }

    #[test]
    fn test_stop_trading_guard_halts_run() {
        let params = SimulationParams {
            stop_trading_loss_pct: 0.01,
            atr_multiplier_sl: 2.2,
            ..scenario_params()
        };
        // SL at 97.8 -> loss 0.5 * 2.2 = 1.1 -> capital 98.9
        let t = table(&[
            (100.0, 100.0, 100.0, Some(1.0)),
            (98.0, 100.0, 97.0, Some(1.0)),
            (100.0, 100.0, 100.0, Some(1.0)),
            (100.0, 110.0, 90.0, Some(1.0)),
        ]);
        let outcome = simulate(&t, &[0.002, 0.002, 0.002, 0.002], params).unwrap();

        assert!(outcome.halted);
        assert_eq!(outcome.ledger.len(), 1);
        assert_eq!(outcome.ledger[0].capital_after, 98.9);
        assert!((outcome.final_capital - 98.9).abs() < 1e-9);
    }

    #[test]
    fn test_end_of_data_force_close() {
        let t = table(&[
            (100.0, 100.0, 100.0, None),
            (100.0, 100.0, 100.0, Some(1.0)),
            (101.0, 101.5, 99.5, Some(1.0)),
        ]);
        let outcome = simulate(&t, &[0.0, 0.002, 0.0], scenario_params()).unwrap();

        assert_eq!(outcome.ledger.len(), 1);
        let trade = &outcome.ledger[0];
        assert_eq!(trade.exit_reason, ExitReason::EndOfData);
        assert_eq!(trade.exit_price, 101.0);
        assert_eq!(trade.exit_time, t.open_times()[2]);
        assert_eq!(trade.gross_profit, 0.5);
        assert_eq!(outcome.skipped_rows, 1);
    }

    #[test]
    fn test_fees_reduce_net_profit() {
        let params = SimulationParams {
            trade_fee_rate: 0.001,
            ..scenario_params()
        };
        let t = table(&[(100.0, 100.0, 100.0, Some(1.0)), (102.0, 104.0, 101.0, Some(1.0))]);
        let outcome = simulate(&t, &[0.002, 0.0], params).unwrap();

        // entry 50 * 0.001 = 0.05, exit 103 * 0.5 * 0.001 = 0.0515
        let trade = &outcome.ledger[0];
        assert_eq!(trade.total_cost, 0.1);
        assert_eq!(trade.net_profit, 1.4);
        assert!((outcome.final_capital - (100.0 + 1.5 - 0.1015)).abs() < 1e-9);
    }

    #[test]
    fn test_leverage_scales_quantity_not_allocation() {
        let params = SimulationParams {
            leverage: 10.0,
            ..scenario_params()
        };
        let t = table(&[(100.0, 100.0, 100.0, Some(1.0)), (102.0, 104.0, 101.0, Some(1.0))]);
        let trade = simulate(&t, &[0.002, 0.0], params).unwrap().ledger.remove(0);

        assert_eq!(trade.allocated_value, 50.0);
        assert_eq!(trade.quantity, 5.0);
        assert_eq!(trade.gross_profit, 15.0);
    }

    #[test]
    fn test_non_positive_stop_abandons_entry() {
        // LONG SL = 1 - 2 * 1 < 0
        let t = table(&[(1.0, 1.0, 1.0, Some(1.0)), (1.0, 1.0, 1.0, Some(1.0))]);
        let outcome = simulate(&t, &[0.002, 0.0], scenario_params()).unwrap();

        assert!(outcome.ledger.is_empty());
        assert_eq!(outcome.abandoned_entries, 1);
        assert_eq!(outcome.final_capital, 100.0);
    }

    #[test]
    fn test_invalid_rows_are_skipped_while_flat() {
        let t = table(&[
            (f64::NAN, f64::NAN, f64::NAN, Some(1.0)),
            (-5.0, -5.0, -5.0, Some(1.0)),
            (100.0, 100.0, 100.0, Some(f64::NAN)),
            (100.0, 100.0, 100.0, Some(1.0)),
            (103.5, 104.0, 103.0, Some(1.0)),
        ]);
        let outcome = simulate(&t, &[0.01, 0.01, 0.01, 0.01, 0.0], scenario_params()).unwrap();

        assert_eq!(outcome.skipped_rows, 3);
        assert_eq!(outcome.ledger.len(), 1);
        assert_eq!(outcome.ledger[0].entry_time, t.open_times()[3]);
    }

    #[test]
    fn test_zero_prediction_never_opens() {
        let params = SimulationParams {
            threshold_retorno_entrada: 0.0,
            ..scenario_params()
        };
        let t = table(&[(100.0, 100.0, 100.0, Some(1.0)); 5]);
        let outcome = simulate(&t, &[0.0; 5], params).unwrap();
        assert!(outcome.ledger.is_empty());
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let t = table(&[(100.0, 100.0, 100.0, Some(1.0)); 3]);
        let err = simulate(&t, &[0.1; 2], scenario_params()).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::LengthMismatch { table: 3, predictions: 2 }
        ));
    }

    #[test]
    fn test_rejects_invalid_params_before_running() {
        let params = SimulationParams {
            pct_operacao: 1.5,
            ..scenario_params()
        };
        assert!(matches!(
            Simulator::new(params),
            Err(SimulationError::InvalidParameter { name: "pct_operacao", .. })
        ));
    }

    #[test]
    fn test_empty_table() {
        let t = table(&[]);
        let outcome = simulate(&t, &[], scenario_params()).unwrap();
        assert!(outcome.ledger.is_empty());
        assert_eq!(outcome.final_capital, 100.0);
    }

    #[test]
    fn test_reenters_on_exit_row() {
        let t = table(&[
            (100.0, 100.0, 100.0, Some(1.0)),
            (103.0, 104.0, 101.0, Some(1.0)),
            (103.0, 103.0, 103.0, Some(1.0)),
        ]);
        let outcome = simulate(&t, &[0.002, -0.002, 0.0], scenario_params()).unwrap();

        assert_eq!(outcome.ledger.len(), 2);
        assert_eq!(outcome.ledger[1].direction, Direction::Short);
        assert_eq!(outcome.ledger[1].entry_time, t.open_times()[1]);
        assert_eq!(outcome.ledger[1].exit_reason, ExitReason::EndOfData);
    }
}
