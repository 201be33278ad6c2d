use crate::backtest::table::PriceTable;
use crate::indicators::annotate_atr;
use crate::models::{Candle, Timeframe};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise
    Uptrend,
    /// Steady downtrend with noise
    Downtrend,
    /// Mean-reverting chop around the starting price
    Sideways,
    /// Large swings (±3% per bar)
    Volatile,
}

impl std::str::FromStr for MarketScenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uptrend" => Ok(Self::Uptrend),
            "downtrend" => Ok(Self::Downtrend),
            "sideways" => Ok(Self::Sideways),
            "volatile" => Ok(Self::Volatile),
            other => Err(format!("unknown scenario '{}'", other)),
        }
    }
}

/// Generates reproducible price tables and prediction series
///
/// Timestamps start at 2024-01-01T00:00:00Z so the same seed always yields
/// byte-identical output.
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
    atr_period: usize,
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 100.0,
            base_volume: 1_000_000.0,
            atr_period: 14,
        }
    }

    pub fn with_atr_period(mut self, period: usize) -> Self {
        self.atr_period = period;
        self
    }

    fn start_time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default()
    }

    /// Closed candles for a scenario, annotated with ATR
    pub fn generate_candles(
        &mut self,
        scenario: MarketScenario,
        num_candles: usize,
        timeframe: Timeframe,
    ) -> Vec<Candle> {
        let start = Self::start_time();
        let step = timeframe.duration();
        let mut candles = Vec::with_capacity(num_candles);
        let mut price = self.base_price;

        for i in 0..num_candles {
            let open = price;
            let change = match scenario {
                MarketScenario::Uptrend => 0.001 + self.rng.gen_range(-0.002..0.002),
                MarketScenario::Downtrend => -0.001 + self.rng.gen_range(-0.002..0.002),
                MarketScenario::Sideways => {
                    (self.base_price - price) / price * 0.1 + self.rng.gen_range(-0.005..0.005)
                }
                MarketScenario::Volatile => self.rng.gen_range(-0.03..0.03),
            };
            price = (price * (1.0 + change)).max(self.base_price * 0.05);

            candles.push(self.create_candle(start + step * i as i32, open, price));
        }

        annotate_atr(&mut candles, self.atr_period);
        candles
    }

    /// Price table plus a row-aligned prediction series
    ///
    /// Each prediction is the realised next-bar return blurred by noise of
    /// `noise` (absolute return units). The last row predicts 0.
    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        num_rows: usize,
        timeframe: Timeframe,
        noise: f64,
    ) -> (PriceTable, Vec<f64>) {
        let candles = self.generate_candles(scenario, num_rows, timeframe);

        let mut predictions: Vec<f64> = candles
            .windows(2)
            .map(|pair| {
                let realised = pair[1].close / pair[0].close - 1.0;
                let blur = if noise > 0.0 {
                    self.rng.gen_range(-noise..noise)
                } else {
                    0.0
                };
                realised + blur
            })
            .collect();
        if !candles.is_empty() {
            predictions.push(0.0);
        }

        (PriceTable::from_candles(&candles), predictions)
    }

    /// Helper to create a candle from open/close and timestamp
    fn create_candle(&mut self, open_time: DateTime<Utc>, open: f64, close: f64) -> Candle {
        // ±0.3% intrabar movement beyond the body
        let noise_pct = 0.003;
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..noise_pct));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..noise_pct));

        // Vary volume ±30%
        let volume = self.base_volume * self.rng.gen_range(0.7..1.3);

        Candle::new(open_time, open, high, low, close, volume, true)
    }
}
