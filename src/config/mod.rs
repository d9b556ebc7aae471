//! Configuration management for polyspike
//!
//! Loads from YAML/TOML files + environment variables via .env, then validates once.
//! Any validation failure is an `InvalidConfiguration` and aborts startup.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Upper bound for every seconds-valued window (one week)
pub const MAX_WINDOW_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub trading: TradingConfig,
    pub detection: DetectionConfig,
    pub risk: RiskConfig,
    pub engine: EngineConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Version tag for logging
    pub tag: String,
    /// Spot symbols to watch (e.g. "BTC/USDT")
    pub symbols: Vec<String>,
    /// Prediction markets tracked per symbol
    #[serde(default = "default_markets")]
    pub markets: Vec<MarketConfig>,
}

/// One up/down prediction market tied to a spot symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketConfig {
    pub market_id: String,
    pub symbol: String,
}

fn default_markets() -> Vec<MarketConfig> {
    vec![
        MarketConfig {
            market_id: "btc-updown-15m".to_string(),
            symbol: "BTC/USDT".to_string(),
        },
        MarketConfig {
            market_id: "eth-updown-15m".to_string(),
            symbol: "ETH/USDT".to_string(),
        },
    ]
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            tag: env!("CARGO_PKG_VERSION").to_string(),
            symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            markets: default_markets(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Minimum divergence score to emit an opportunity
    pub divergence_threshold: f64,
    /// Minimum expected profit (quote units, net of fee) to emit an opportunity
    pub min_profit_threshold: f64,
    /// Stake per position in USD
    pub position_size_usd: f64,
    /// Maximum concurrently open positions
    pub max_positions: usize,
    /// Hard cap on a single position
    pub max_position_size_usd: f64,
    /// Fee charged on notional at close (0.02 = 2%)
    pub fee_rate: f64,
    /// Paper balance the statistics are measured against
    pub initial_balance_usd: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            divergence_threshold: 0.05,
            min_profit_threshold: 0.02,
            position_size_usd: 100.0,
            max_positions: 5,
            max_position_size_usd: 500.0,
            fee_rate: 0.02,
            initial_balance_usd: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum |relative move| that counts as a spike
    pub spike_threshold: f64,
    /// Sub-window the spike baseline is taken from
    pub spike_window_seconds: u64,
    /// Retention of the rolling price window
    pub price_history_seconds: u64,
    /// Dedup window per (symbol, market, direction)
    pub cooldown_seconds: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            spike_threshold: 0.015,
            spike_window_seconds: 10,
            price_history_seconds: 30,
            cooldown_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Stop loss as fraction of entry (0.15 = 15%)
    pub stop_loss_pct: f64,
    /// Take profit as fraction of entry (0.90 = 90%)
    pub take_profit_pct: f64,
    /// Force close after this many seconds
    pub max_hold_time_seconds: u64,
    /// Realized losses per UTC day before new opens halt
    pub max_daily_loss_usd: f64,
    /// All-time realized losses that trigger emergency shutdown
    pub emergency_shutdown_loss_usd: f64,
    /// Clear a persisted emergency flag at startup (operator reset)
    pub reset_emergency_on_start: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.15,
            take_profit_pct: 0.90,
            max_hold_time_seconds: 870,
            max_daily_loss_usd: 1000.0,
            emergency_shutdown_loss_usd: 5000.0,
            reset_emergency_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tick period of the evaluation loop
    pub refresh_interval_seconds: u64,
    /// Upper bound on any single quote/price fetch
    pub fetch_timeout_ms: u64,
    /// Stats snapshot + status log every N ticks
    pub stats_interval_ticks: u64,
    /// Bounded hand-off between price producers and the loop
    pub price_channel_capacity: usize,
    /// Warn when a symbol has been silent this long
    pub stale_feed_seconds: u64,
    /// Producer reconnect backoff
    pub feed_retry_initial_ms: u64,
    pub feed_retry_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: 5,
            fetch_timeout_ms: 2000,
            stats_interval_ticks: 10,
            price_channel_capacity: 1024,
            stale_feed_seconds: 30,
            feed_retry_initial_ms: 500,
            feed_retry_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Disable to run purely in memory
    pub enabled: bool,
    /// Data directory
    pub data_dir: String,
    /// Attempts per durable write before degrading to memory
    pub write_retries: u32,
    /// Checkpoint the ledger every N ticks
    pub checkpoint_interval_ticks: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: "./data".to_string(),
            write_retries: 3,
            checkpoint_interval_ticks: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// RNG seed; 0 picks a random one
    pub seed: u64,
    /// Milliseconds between simulated spot ticks
    pub tick_ms: u64,
    /// Per-tick relative volatility of the random walk
    pub volatility: f64,
    /// Chance per tick of a jump
    pub jump_probability: f64,
    /// Relative size of a jump
    pub jump_size: f64,
    /// Seconds the simulated market takes to catch up with spot
    pub quote_lag_seconds: f64,
    /// Quote move per unit relative spot move
    pub quote_sensitivity: f64,
    /// Uniform quote noise amplitude
    pub quote_noise: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            tick_ms: 1000,
            volatility: 0.0008,
            jump_probability: 0.01,
            jump_size: 0.02,
            quote_lag_seconds: 20.0,
            quote_sensitivity: 10.0,
            quote_noise: 0.005,
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment, then validate
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.symbols", vec!["BTC/USDT", "ETH/USDT"])?
            // Trading defaults
            .set_default("trading.divergence_threshold", 0.05)?
            .set_default("trading.min_profit_threshold", 0.02)?
            .set_default("trading.position_size_usd", 100.0)?
            .set_default("trading.max_positions", 5)?
            .set_default("trading.max_position_size_usd", 500.0)?
            .set_default("trading.fee_rate", 0.02)?
            .set_default("trading.initial_balance_usd", 1000.0)?
            // Detection defaults
            .set_default("detection.spike_threshold", 0.015)?
            .set_default("detection.spike_window_seconds", 10)?
            .set_default("detection.price_history_seconds", 30)?
            .set_default("detection.cooldown_seconds", 60)?
            // Risk defaults
            .set_default("risk.stop_loss_pct", 0.15)?
            .set_default("risk.take_profit_pct", 0.90)?
            .set_default("risk.max_hold_time_seconds", 870)?
            .set_default("risk.max_daily_loss_usd", 1000.0)?
            .set_default("risk.emergency_shutdown_loss_usd", 5000.0)?
            .set_default("risk.reset_emergency_on_start", false)?
            // Engine defaults
            .set_default("engine.refresh_interval_seconds", 5)?
            .set_default("engine.fetch_timeout_ms", 2000)?
            .set_default("engine.stats_interval_ticks", 10)?
            .set_default("engine.price_channel_capacity", 1024)?
            .set_default("engine.stale_feed_seconds", 30)?
            .set_default("engine.feed_retry_initial_ms", 500)?
            .set_default("engine.feed_retry_max_ms", 30_000)?
            // Persistence defaults
            .set_default("persistence.enabled", true)?
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.write_retries", 3)?
            .set_default("persistence.checkpoint_interval_ticks", 12)?
            // Logging defaults
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Simulation defaults
            .set_default("simulation.seed", 0)?
            .set_default("simulation.tick_ms", 1000)?
            .set_default("simulation.volatility", 0.0008)?
            .set_default("simulation.jump_probability", 0.01)?
            .set_default("simulation.jump_size", 0.02)?
            .set_default("simulation.quote_lag_seconds", 20.0)?
            .set_default("simulation.quote_sensitivity", 10.0)?
            .set_default("simulation.quote_noise", 0.005)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (POLYSPIKE__TRADING__FEE_RATE=...)
            .add_source(
                Environment::with_prefix("POLYSPIKE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Check every invariant the engine relies on
    pub fn validate(&self) -> EngineResult<()> {
        let t = &self.trading;
        let d = &self.detection;
        let r = &self.risk;
        let e = &self.engine;

        ensure(
            t.divergence_threshold > 0.0 && t.divergence_threshold < 1.0,
            "trading.divergence_threshold must be in (0, 1)",
        )?;
        ensure(
            t.min_profit_threshold >= 0.0 && t.min_profit_threshold < 1.0,
            "trading.min_profit_threshold must be in [0, 1)",
        )?;
        ensure(
            t.position_size_usd > 0.0,
            "trading.position_size_usd must be positive",
        )?;
        ensure(
            t.position_size_usd <= t.max_position_size_usd,
            "trading.position_size_usd must not exceed trading.max_position_size_usd",
        )?;
        ensure(t.max_positions >= 1, "trading.max_positions must be at least 1")?;
        ensure(
            t.fee_rate >= 0.0 && t.fee_rate < 1.0,
            "trading.fee_rate must be in [0, 1)",
        )?;
        ensure(
            t.initial_balance_usd >= 0.0,
            "trading.initial_balance_usd must not be negative",
        )?;

        ensure(
            d.spike_threshold > 0.0 && d.spike_threshold < 1.0,
            "detection.spike_threshold must be in (0, 1)",
        )?;
        ensure(
            d.spike_window_seconds >= 1,
            "detection.spike_window_seconds must be at least 1",
        )?;
        ensure(
            d.price_history_seconds >= d.spike_window_seconds,
            "detection.price_history_seconds must cover detection.spike_window_seconds",
        )?;
        ensure(
            d.price_history_seconds <= MAX_WINDOW_SECONDS,
            "detection.price_history_seconds must be at most one week",
        )?;
        ensure(
            d.cooldown_seconds <= MAX_WINDOW_SECONDS,
            "detection.cooldown_seconds must be at most one week",
        )?;

        ensure(
            r.stop_loss_pct > 0.0 && r.stop_loss_pct < 1.0,
            "risk.stop_loss_pct must be in (0, 1)",
        )?;
        ensure(r.take_profit_pct > 0.0, "risk.take_profit_pct must be positive")?;
        ensure(
            r.max_hold_time_seconds >= 1 && r.max_hold_time_seconds <= MAX_WINDOW_SECONDS,
            "risk.max_hold_time_seconds must be between 1 second and one week",
        )?;
        ensure(
            r.max_daily_loss_usd > 0.0,
            "risk.max_daily_loss_usd must be positive",
        )?;
        ensure(
            t.position_size_usd <= r.max_daily_loss_usd,
            "trading.position_size_usd must fit inside risk.max_daily_loss_usd",
        )?;
        ensure(
            r.emergency_shutdown_loss_usd > 0.0,
            "risk.emergency_shutdown_loss_usd must be positive",
        )?;

        ensure(
            e.refresh_interval_seconds >= 1,
            "engine.refresh_interval_seconds must be at least 1",
        )?;
        ensure(e.fetch_timeout_ms >= 1, "engine.fetch_timeout_ms must be at least 1")?;
        ensure(
            e.stale_feed_seconds <= MAX_WINDOW_SECONDS,
            "engine.stale_feed_seconds must be at most one week",
        )?;
        ensure(
            e.price_channel_capacity >= 1,
            "engine.price_channel_capacity must be at least 1",
        )?;
        ensure(
            e.feed_retry_initial_ms >= 1 && e.feed_retry_initial_ms <= e.feed_retry_max_ms,
            "engine.feed_retry_initial_ms must be in [1, engine.feed_retry_max_ms]",
        )?;

        ensure(
            !self.bot.symbols.is_empty(),
            "at least one symbol must be enabled",
        )?;
        ensure(
            !self.bot.markets.is_empty(),
            "at least one market must be configured",
        )?;
        for market in &self.bot.markets {
            if !self.bot.symbols.contains(&market.symbol) {
                return Err(EngineError::InvalidConfiguration(format!(
                    "market {} references unknown symbol {}",
                    market.market_id, market.symbol
                )));
            }
        }

        Ok(())
    }

    /// Markets tracked for a spot symbol
    pub fn markets_for<'a>(&'a self, symbol: &'a str) -> impl Iterator<Item = &'a MarketConfig> {
        self.bot.markets.iter().filter(move |m| m.symbol == symbol)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            concat!(
                "bot={} symbols={:?} markets={} spike={:.3} div={:.3} ",
                "size=${:.0} max_pos={} sl={:.2} tp={:.2}"
            ),
            self.bot.tag,
            self.bot.symbols,
            self.bot.markets.len(),
            self.detection.spike_threshold,
            self.trading.divergence_threshold,
            self.trading.position_size_usd,
            self.trading.max_positions,
            self.risk.stop_loss_pct,
            self.risk.take_profit_pct
        )
    }
}

fn ensure(condition: bool, message: &str) -> EngineResult<()> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::InvalidConfiguration(message.to_string()))
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
