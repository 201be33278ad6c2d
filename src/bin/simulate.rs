use anyhow::{bail, Context, Result};
use clap::Parser;
use cryptoai::backtest::{
    load_predictions, write_ledger_csv, MarketScenario, PriceTable, Simulator, SyntheticDataGenerator,
};
use cryptoai::config::Settings;
use cryptoai::Timeframe;
use std::path::PathBuf;

/// Replay a prediction series against a price table and report the results
#[derive(Parser)]
#[command(name = "simulate", about = "ATR take-profit/stop-loss backtest over model predictions")]
struct Cli {
    /// Price CSV with open_time, close, atr (high/low optional)
    #[arg(long, required_unless_present = "synthetic")]
    prices: Option<PathBuf>,

    /// Prediction CSV with a `prediction` column, row-aligned with the prices
    #[arg(long, required_unless_present = "synthetic")]
    predictions: Option<PathBuf>,

    /// Settings file; only the [simulation] section is used
    #[arg(long, default_value = "config/cryptoai.toml")]
    config: PathBuf,

    /// Write the trade ledger here
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Write the metrics JSON here
    #[arg(long)]
    metrics: Option<PathBuf>,

    /// Generate N synthetic rows instead of reading CSVs
    #[arg(long, conflicts_with_all = ["prices", "predictions"])]
    synthetic: Option<usize>,

    /// Seed for --synthetic
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Scenario for --synthetic: uptrend, downtrend, sideways, volatile
    #[arg(long, default_value = "sideways")]
    scenario: MarketScenario,

    /// Bar size for --synthetic
    #[arg(long, default_value = "15m")]
    timeframe: Timeframe,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cryptoai=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;
    let simulator = Simulator::new(settings.simulation.clone())?;

    let (table, predictions) = match (cli.synthetic, &cli.prices, &cli.predictions) {
        (Some(rows), _, _) => {
            tracing::info!("Generating {} synthetic {} rows (seed {})", rows, cli.timeframe, cli.seed);
            SyntheticDataGenerator::new(cli.seed)
                .with_atr_period(settings.atr_period)
                .generate(cli.scenario, rows, cli.timeframe, 0.002)
        }
        (None, Some(prices), Some(preds)) => {
            let table = PriceTable::from_csv(prices)
                .with_context(|| format!("Failed to load prices from {}", prices.display()))?;
            let predictions = load_predictions(preds)
                .with_context(|| format!("Failed to load predictions from {}", preds.display()))?;
            (table, predictions)
        }
        _ => bail!("Provide --prices and --predictions, or --synthetic N"),
    };

    let outcome = simulator.run(&table, &predictions)?;
    let metrics = outcome.metrics();

    metrics.print_report();
    println!(
        "Rows: {}  skipped: {}  abandoned entries: {}{}",
        table.len(),
        outcome.skipped_rows,
        outcome.abandoned_entries,
        if outcome.halted { "  (stopped by loss guard)" } else { "" }
    );

    if let Some(path) = &cli.ledger {
        write_ledger_csv(path, &outcome.ledger)?;
    }
    if let Some(path) = &cli.metrics {
        metrics.write_json(path)?;
    }

    Ok(())
}
