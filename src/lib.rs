// Core modules
pub mod api;
pub mod backtest;
pub mod config;
pub mod error;
pub mod indicators;
pub mod models;
pub mod stream;

// Re-export commonly used types
pub use backtest::{Metrics, PriceTable, SimulationOutcome, SimulationParams, Simulator, TradeRecord};
pub use error::{SimulationError, StreamError};
pub use models::*;
pub use stream::{StreamBuffer, StreamRegistry, StreamStatus};

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
