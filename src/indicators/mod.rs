// Volatility indicators used to derive per-candle ATR

pub mod atr;

pub use atr::{annotate_atr, calculate_atr, calculate_atr_series, WilderAtr};
