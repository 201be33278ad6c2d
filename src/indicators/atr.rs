/// Average True Range (ATR) indicator
///
/// Measures market volatility by calculating the average of true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// Uses Wilder's smoothing for the moving average. The first candle of a series only
/// provides a previous close, so the first ATR value lands on index `period`.
use crate::models::Candle;

/// Incremental Wilder ATR, fed one closed candle at a time
///
/// Stream buffers keep one of these so live closes extend the same series the
/// backfill produced.
#[derive(Debug, Clone)]
pub struct WilderAtr {
    period: usize,
    prev_close: Option<f64>,
    warmup: Vec<f64>,
    value: Option<f64>,
}

impl WilderAtr {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            warmup: Vec::with_capacity(period),
            value: None,
        }
    }

    /// Feed the next candle, returning the ATR as of that candle (None while warming up)
    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let prev_close = match self.prev_close.replace(close) {
            Some(prev) => prev,
            None => return None,
        };

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let period = self.period as f64;
        self.value = match self.value {
            Some(atr) => Some((atr * (period - 1.0) + tr) / period),
            None => {
                self.warmup.push(tr);
                if self.warmup.len() == self.period {
                    let first = self.warmup.iter().sum::<f64>() / period;
                    self.warmup.clear();
                    Some(first)
                } else {
                    None
                }
            }
        };

        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

/// Calculate ATR for the given candles
///
/// Returns the current ATR value, or None if insufficient data
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    calculate_atr_series(candles, period)
        .last()
        .copied()
        .flatten()
}

/// ATR aligned with `candles`: one entry per candle, None until the first full period
pub fn calculate_atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let mut atr = WilderAtr::new(period);
    candles
        .iter()
        .map(|c| atr.update(c.high, c.low, c.close))
        .collect()
}

/// Write the ATR series into each candle's `atr` field
pub fn annotate_atr(candles: &mut [Candle], period: usize) -> WilderAtr {
    let mut atr = WilderAtr::new(period);
    for candle in candles.iter_mut() {
        candle.atr = atr.update(candle.high, candle.low, candle.close);
    }
    atr
}
