use crate::api::{BINANCE_FUTURES_REST, BINANCE_FUTURES_WS};
use crate::backtest::SimulationParams;
use crate::error::SimulationError;
use crate::models::Timeframe;
use crate::stream::DEFAULT_ATR_PERIOD;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Prefix for environment overrides, e.g. `CRYPTOAI__SIMULATION__LEVERAGE=10`
pub const ENV_PREFIX: &str = "CRYPTOAI";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamSettings {
    pub symbol: String,
    pub timeframe: Timeframe,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

fn default_max_len() -> usize {
    500
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BinanceSettings {
    pub rest_base_url: String,
    pub ws_base_url: String,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            rest_base_url: BINANCE_FUTURES_REST.to_string(),
            ws_base_url: BINANCE_FUTURES_WS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub simulation: SimulationParams,
    pub streams: Vec<StreamSettings>,
    pub binance: BinanceSettings,
    pub atr_period: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            simulation: SimulationParams::default(),
            streams: vec![StreamSettings {
                symbol: "BTC/USDT:USDT".to_string(),
                timeframe: Timeframe::M1,
                max_len: default_max_len(),
            }],
            binance: BinanceSettings::default(),
            atr_period: DEFAULT_ATR_PERIOD,
        }
    }
}

impl Settings {
    /// Optional TOML/YAML/JSON file at `path`, then `CRYPTOAI__*` environment variables
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub fn load_with_prefix(path: impl AsRef<Path>, env_prefix: &str) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;

        let settings: Settings = settings
            .try_deserialize()
            .context("Invalid settings")?;

        tracing::debug!("Loaded settings: {:?}", settings);
        Ok(settings)
    }

    /// Simulation parameters, validated
    pub fn simulation_params(&self) -> std::result::Result<SimulationParams, SimulationError> {
        self.simulation.validate()?;
        Ok(self.simulation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            Settings::load_with_prefix(dir.path().join("absent.toml"), "CRYPTOAI_TEST_NONE").unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.simulation.leverage, 25.0);
        assert_eq!(settings.atr_period, 14);
    }

    #[test]
    fn test_file_values_merge_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
atr_period = 7

[simulation]
leverage = 5.0
atr_multiplier_tp = 3.0

[[streams]]
symbol = "ETH/USDT:USDT"
timeframe = "15m"

[[streams]]
symbol = "BTCUSDT"
timeframe = "1h"
max_len = 100
"#
        )
        .unwrap();

        let settings = Settings::load_with_prefix(&path, "CRYPTOAI_TEST_NONE").unwrap();

        assert_eq!(settings.atr_period, 7);
        assert_eq!(settings.simulation.leverage, 5.0);
        assert_eq!(settings.simulation.atr_multiplier_tp, 3.0);
        assert_eq!(settings.simulation.pct_operacao, 0.5);
        assert_eq!(settings.streams.len(), 2);
        assert_eq!(settings.streams[0].timeframe, Timeframe::M15);
        assert_eq!(settings.streams[0].max_len, 500);
        assert_eq!(settings.streams[1].max_len, 100);
        assert_eq!(settings.binance, BinanceSettings::default());
    }

    #[test]
    fn test_environment_overrides_file() {
        std::env::set_var("CRYPTOAI_ENVTEST__SIMULATION__LEVERAGE", "3");
        std::env::set_var("CRYPTOAI_ENVTEST__BINANCE__REST_BASE_URL", "http://localhost:9999");

        let dir = tempfile::tempdir().unwrap();
        let settings =
            Settings::load_with_prefix(dir.path().join("absent.toml"), "CRYPTOAI_ENVTEST").unwrap();

        assert_eq!(settings.simulation.leverage, 3.0);
        assert_eq!(settings.binance.rest_base_url, "http://localhost:9999");
    }

    #[test]
    fn test_invalid_simulation_params_rejected() {
        let mut settings = Settings::default();
        settings.simulation.pct_operacao = 2.0;
        assert!(settings.simulation_params().is_err());
    }
}
