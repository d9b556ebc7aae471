//! Paper simulation sources
//!
//! `RandomWalkFeed` produces spot prices; `LaggingQuoteSource` produces market
//! quotes that follow the spot move with a lag. Together they let the binary
//! run end to end without exchange or market clients.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::{MarketConfig, SimulationConfig};
use crate::error::{EngineError, EngineResult};
use crate::feed::{PriceFeed, QuoteSource};
use crate::types::PricePoint;

const MIN_QUOTE: f64 = 0.01;
const MAX_QUOTE: f64 = 0.99;

/// Latest simulated spot per symbol, shared between feeds and the quote source
#[derive(Debug, Clone, Default)]
pub struct SpotBoard(Arc<RwLock<HashMap<String, f64>>>);

impl SpotBoard {
    pub fn set(&self, symbol: &str, price: f64) {
        if let Ok(mut board) = self.0.write() {
            board.insert(symbol.to_string(), price);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.0.read().ok()?.get(symbol).copied()
    }
}

fn rng_for(seed: u64, stream: u64) -> StdRng {
    if seed == 0 {
        StdRng::from_entropy()
    } else {
        StdRng::seed_from_u64(seed.wrapping_add(stream))
    }
}

/// Starting spot for well-known symbols
pub fn initial_price(symbol: &str) -> f64 {
    match symbol.split('/').next().unwrap_or(symbol) {
        "BTC" => 50_000.0,
        "ETH" => 2_500.0,
        "SOL" => 100.0,
        "XRP" => 0.5,
        _ => 100.0,
    }
}

/// Random-walk spot prices with occasional jumps
pub struct RandomWalkFeed {
    name: String,
    symbol: String,
    price: f64,
    interval: Duration,
    volatility: f64,
    jump_probability: f64,
    jump_size: f64,
    rng: StdRng,
    board: SpotBoard,
}

impl RandomWalkFeed {
    pub fn new(symbol: &str, stream: u64, config: &SimulationConfig, board: SpotBoard) -> Self {
        let price = initial_price(symbol);
        board.set(symbol, price);
        Self {
            name: format!("sim:{}", symbol),
            symbol: symbol.to_string(),
            price,
            interval: Duration::from_millis(config.tick_ms),
            volatility: config.volatility,
            jump_probability: config.jump_probability.clamp(0.0, 1.0),
            jump_size: config.jump_size,
            rng: rng_for(config.seed, stream),
            board,
        }
    }

    fn step(&mut self) -> f64 {
        let mut change = self.rng.gen_range(-1.0f64..=1.0) * self.volatility;
        if self.rng.gen_bool(self.jump_probability) {
            let sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            change += sign * self.jump_size;
        }
        // Keep the walk strictly positive
        self.price = (self.price * (1.0 + change)).max(f64::EPSILON);
        self.price
    }
}

#[async_trait]
impl PriceFeed for RandomWalkFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_price(&mut self) -> EngineResult<PricePoint> {
        tokio::time::sleep(self.interval).await;
        let price = self.step();
        self.board.set(&self.symbol, price);
        Ok(PricePoint::new(self.symbol.clone(), price, Utc::now()))
    }
}

#[derive(Debug)]
struct MarketState {
    reference_spot: f64,
    quote: f64,
    updated: Instant,
}

/// Quotes that drift toward a fair value implied by the spot move
pub struct LaggingQuoteSource {
    markets: HashMap<String, String>,
    board: SpotBoard,
    lag_seconds: f64,
    sensitivity: f64,
    noise: f64,
    state: Mutex<HashMap<String, MarketState>>,
    rng: Mutex<StdRng>,
}

impl LaggingQuoteSource {
    pub fn new(markets: &[MarketConfig], config: &SimulationConfig, board: SpotBoard) -> Self {
        Self {
            markets: markets
                .iter()
                .map(|m| (m.market_id.clone(), m.symbol.clone()))
                .collect(),
            board,
            lag_seconds: config.quote_lag_seconds.max(f64::EPSILON),
            sensitivity: config.quote_sensitivity,
            noise: config.quote_noise,
            state: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng_for(config.seed, u64::MAX / 2)),
        }
    }

    fn missing(market_id: &str) -> EngineError {
        EngineError::MissingQuote {
            market_id: market_id.to_string(),
        }
    }
}

#[async_trait]
impl QuoteSource for LaggingQuoteSource {
    fn name(&self) -> &str {
        "sim-quotes"
    }

    async fn fetch_quote(&self, market_id: &str) -> EngineResult<f64> {
        let symbol = self
            .markets
            .get(market_id)
            .ok_or_else(|| Self::missing(market_id))?;
        let spot = self.board.get(symbol).ok_or_else(|| Self::missing(market_id))?;

        let noise = match self.rng.lock() {
            Ok(mut rng) if self.noise > 0.0 => rng.gen_range(-self.noise..=self.noise),
            _ => 0.0,
        };

        let mut state = self.state.lock().map_err(|_| Self::missing(market_id))?;
        let now = Instant::now();
        let market = state
            .entry(market_id.to_string())
            .or_insert_with(|| MarketState {
                reference_spot: spot,
                quote: 0.5,
                updated: now,
            });

        let move_pct = (spot - market.reference_spot) / market.reference_spot;
        let fair = (0.5 + self.sensitivity * move_pct).clamp(MIN_QUOTE, MAX_QUOTE);
        let dt = now.duration_since(market.updated).as_secs_f64();
        let alpha = 1.0 - (-dt / self.lag_seconds).exp();

        market.quote =
            (market.quote + alpha * (fair - market.quote) + noise).clamp(MIN_QUOTE, MAX_QUOTE);
        market.updated = now;
        Ok(market.quote)
    }
}
