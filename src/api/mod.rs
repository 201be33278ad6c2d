pub mod binance;
pub mod binance_ws;

pub use binance::{exchange_symbol, BinanceClient, BINANCE_FUTURES_REST};
pub use binance_ws::{BinanceKlineFeed, BINANCE_FUTURES_WS};
