pub mod ledger;
pub mod metrics;
pub mod params;
pub mod simulator;
pub mod synthetic;
pub mod table;

pub use ledger::{read_ledger_csv, write_ledger, write_ledger_csv, Direction, ExitReason, TradeRecord};
pub use metrics::Metrics;
pub use params::SimulationParams;
pub use simulator::{simulate, Position, SimulationOutcome, Simulator};
pub use synthetic::{MarketScenario, SyntheticDataGenerator};
pub use table::{load_predictions, read_predictions, PriceTable};
