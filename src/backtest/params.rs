use crate::error::SimulationError;
use serde::{Deserialize, Serialize};

/// Risk and sizing parameters for one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    pub initial_capital: f64,
    pub leverage: f64,
    /// Fraction of current capital committed per trade, in (0, 1]
    pub pct_operacao: f64,
    /// Minimum |predicted return| needed to open a position
    pub threshold_retorno_entrada: f64,
    /// Fee charged per side
    pub trade_fee_rate: f64,
    pub atr_multiplier_tp: f64,
    pub atr_multiplier_sl: f64,
    /// Halt once capital falls this fraction below the initial capital
    pub stop_trading_loss_pct: f64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            initial_capital: 100.0,
            leverage: 25.0,
            pct_operacao: 0.5,
            threshold_retorno_entrada: 0.0005,
            trade_fee_rate: 0.0002,
            atr_multiplier_tp: 4.0,
            atr_multiplier_sl: 2.0,
            stop_trading_loss_pct: 0.5,
        }
    }
}

fn invalid(name: &'static str, value: f64, reason: &'static str) -> SimulationError {
    SimulationError::InvalidParameter {
        name,
        value,
        reason,
    }
}

impl SimulationParams {
    /// Reject out-of-range parameters before any simulation work starts
    pub fn validate(&self) -> Result<(), SimulationError> {
        let finite = [
            ("initial_capital", self.initial_capital),
            ("leverage", self.leverage),
            ("pct_operacao", self.pct_operacao),
            ("threshold_retorno_entrada", self.threshold_retorno_entrada),
            ("trade_fee_rate", self.trade_fee_rate),
            ("atr_multiplier_tp", self.atr_multiplier_tp),
            ("atr_multiplier_sl", self.atr_multiplier_sl),
            ("stop_trading_loss_pct", self.stop_trading_loss_pct),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(invalid(name, value, "must be a finite number"));
            }
        }

        if self.initial_capital <= 0.0 {
            return Err(invalid("initial_capital", self.initial_capital, "must be positive"));
        }
        if !(self.pct_operacao > 0.0 && self.pct_operacao <= 1.0) {
            return Err(invalid("pct_operacao", self.pct_operacao, "must be in (0, 1]"));
        }
        if self.threshold_retorno_entrada < 0.0 {
            return Err(invalid(
                "threshold_retorno_entrada",
                self.threshold_retorno_entrada,
                "must be non-negative",
            ));
        }
        if self.atr_multiplier_tp <= 0.0 {
            return Err(invalid("atr_multiplier_tp", self.atr_multiplier_tp, "must be positive"));
        }
        if self.atr_multiplier_sl <= 0.0 {
            return Err(invalid("atr_multiplier_sl", self.atr_multiplier_sl, "must be positive"));
        }
        if self.leverage <= 0.0 {
            return Err(invalid("leverage", self.leverage, "must be positive"));
        }
        if self.trade_fee_rate < 0.0 {
            return Err(invalid("trade_fee_rate", self.trade_fee_rate, "must be non-negative"));
        }
        if self.stop_trading_loss_pct < 0.0 {
            return Err(invalid(
                "stop_trading_loss_pct",
                self.stop_trading_loss_pct,
                "must be non-negative",
            ));
        }

        if self.atr_multiplier_tp <= self.atr_multiplier_sl {
            tracing::warn!(
                "atr_multiplier_tp ({}) is not above atr_multiplier_sl ({}); reward/risk per trade is at most 1:1",
                self.atr_multiplier_tp,
                self.atr_multiplier_sl
            );
        }

        Ok(())
    }

    /// Capital level at or below which the run halts
    pub fn stop_trading_level(&self) -> f64 {
        self.initial_capital * (1.0 - self.stop_trading_loss_pct)
    }
}
