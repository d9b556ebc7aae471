//! Decision engine - the single-writer tick loop
//!
//! Each tick, in order:
//! 1. drain prices from the producer channel into the history tracker
//! 2. prune stale points, roll the risk day
//! 3. spike -> quote -> opportunity -> cooldown -> risk gate -> open
//! 4. refresh quotes for open positions, run the risk scan, book closes
//! 5. periodic stats snapshot, checkpoint and status log
//!
//! Shutdown is only observed between ticks.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::EngineError;
use crate::feed::{PriceHistoryTracker, QuoteSource, SpikeDetector};
use crate::ledger::{LedgerLimits, Position, PositionLedger};
use crate::persistence::{PersistenceStore, StatsTracker, TradingStats};
use crate::risk::RiskController;
use crate::strategy::{CooldownFilter, OpportunityEngine};
use crate::types::{is_valid_quote, ExitReason, PricePoint};

/// What one tick did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub prices_ingested: usize,
    pub spikes: usize,
    pub opened: Vec<Position>,
    pub closed: Vec<Position>,
    pub rejected: usize,
    pub degraded_quotes: usize,
    /// Feeds that went stale this tick
    pub stale_feeds: usize,
}

pub struct Engine {
    config: AppConfig,
    tracker: PriceHistoryTracker,
    detector: SpikeDetector,
    opportunities: OpportunityEngine,
    cooldown: CooldownFilter,
    ledger: PositionLedger,
    risk: RiskController,
    store: PersistenceStore,
    stats: StatsTracker,
    quotes: Box<dyn QuoteSource>,
    quote_cache: HashMap<String, f64>,
    prices: mpsc::Receiver<PricePoint>,
    last_price_at: HashMap<String, DateTime<Utc>>,
    stale_symbols: HashSet<String>,
    tick_count: u64,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        quotes: Box<dyn QuoteSource>,
        prices: mpsc::Receiver<PricePoint>,
        store: PersistenceStore,
        now: DateTime<Utc>,
    ) -> Self {
        let t = &config.trading;
        let d = &config.detection;

        Self {
            tracker: PriceHistoryTracker::new(d.price_history_seconds),
            detector: SpikeDetector::new(d.spike_threshold, d.spike_window_seconds),
            opportunities: OpportunityEngine::new(
                t.divergence_threshold,
                t.min_profit_threshold,
                t.fee_rate,
            ),
            cooldown: CooldownFilter::new(d.cooldown_seconds),
            ledger: PositionLedger::new(LedgerLimits {
                max_positions: t.max_positions,
                max_position_size_usd: t.max_position_size_usd,
                cooldown_seconds: d.cooldown_seconds,
                fee_rate: t.fee_rate,
            }),
            risk: RiskController::new(config.risk.clone(), now),
            stats: StatsTracker::new(t.initial_balance_usd),
            store,
            quotes,
            quote_cache: HashMap::new(),
            prices,
            last_price_at: HashMap::new(),
            stale_symbols: HashSet::new(),
            tick_count: 0,
            config,
        }
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn risk(&self) -> &RiskController {
        &self.risk
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    pub fn store(&self) -> &PersistenceStore {
        &self.store
    }

    pub fn tracker(&self) -> &PriceHistoryTracker {
        &self.tracker
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Reload positions, risk state and stats before the first tick
    pub fn restore(&mut self, now: DateTime<Utc>) -> Result<()> {
        let recovered = self
            .store
            .load()
            .context("Failed to load persisted engine state")?;

        if let Some(state) = recovered.risk {
            self.risk.restore_state(state);
        }
        if let Some(stats) = recovered.stats {
            self.stats = stats;
        }

        for position in &recovered.closed_since_checkpoint {
            self.risk.record_close(position);
            self.stats.record_close(position);
            self.ledger.restore(position.clone());
        }

        for position in recovered.open_positions {
            self.cooldown.mark(
                &position.symbol,
                &position.market_id,
                position.direction,
                position.entry_time,
            );
            info!(
                id = %position.position_id,
                market = %position.market_id,
                direction = %position.direction,
                entry = position.entry_price,
                "Resuming monitoring of open position"
            );
            self.ledger.restore(position);
        }

        if self.config.risk.reset_emergency_on_start && self.risk.state().emergency_triggered {
            self.risk.reset_emergency();
        }
        self.risk.roll_day(now);

        info!(
            open = self.ledger.open_count(),
            trades = self.stats.trade_count(),
            emergency = self.risk.state().emergency_triggered,
            "Engine state restored"
        );
        Ok(())
    }

    /// Quote with a time bound; falls back to the last known value
    async fn fetch_quote(&mut self, market_id: &str, report: &mut TickReport) -> Option<f64> {
        let timeout = Duration::from_millis(self.config.engine.fetch_timeout_ms);
        let reason = match tokio::time::timeout(timeout, self.quotes.fetch_quote(market_id)).await {
            Ok(Ok(quote)) if is_valid_quote(quote) => {
                self.quote_cache.insert(market_id.to_string(), quote);
                return Some(quote);
            }
            Ok(Ok(quote)) => format!("quote {} outside [0, 1]", quote),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", timeout),
        };

        report.degraded_quotes += 1;
        let cached = self.quote_cache.get(market_id).copied();
        warn!(
            market = market_id,
            error = %reason,
            fallback = ?cached,
            "Degraded quote data"
        );
        cached
    }

    fn ingest(&mut self, point: PricePoint, touched: &mut BTreeSet<String>) -> bool {
        let symbol = point.symbol.clone();
        let timestamp = point.timestamp;
        match self.tracker.push(point) {
            Ok(true) => {
                self.last_price_at.insert(symbol.clone(), timestamp);
                if self.stale_symbols.remove(&symbol) {
                    info!(symbol = %symbol, "Price feed recovered");
                }
                touched.insert(symbol);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "Rejected price update");
                false
            }
        }
    }

    /// Warn once per silent episode; returns how many feeds just went stale
    fn check_staleness(&mut self, now: DateTime<Utc>) -> usize {
        let limit = ChronoDuration::seconds(self.config.engine.stale_feed_seconds as i64);
        let mut newly_stale = 0;
        for (symbol, last) in &self.last_price_at {
            if now - *last >= limit && self.stale_symbols.insert(symbol.clone()) {
                newly_stale += 1;
                warn!(
                    symbol = %symbol,
                    silent_for = (now - *last).num_seconds(),
                    "Price feed stale, running on old data"
                );
            }
        }
        newly_stale
    }

    pub fn is_stale(&self, symbol: &str) -> bool {
        self.stale_symbols.contains(symbol)
    }

    /// One evaluation pass. All opens and closes are applied before return.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        self.tick_count += 1;
        let mut report = TickReport {
            tick: self.tick_count,
            ..Default::default()
        };

        let mut touched = BTreeSet::new();
        while let Ok(point) = self.prices.try_recv() {
            if self.ingest(point, &mut touched) {
                report.prices_ingested += 1;
            }
        }

        self.tracker.prune(now);
        report.stale_feeds = self.check_staleness(now);
        self.risk.roll_day(now);

        for symbol in &touched {
            self.evaluate_symbol(symbol, now, &mut report).await;
        }

        self.monitor_positions(now, &mut report).await;

        let stats_every = self.config.engine.stats_interval_ticks;
        if stats_every > 0 && self.tick_count % stats_every == 0 {
            self.write_stats(now);
            self.log_status(now);
        }
        let checkpoint_every = self.config.persistence.checkpoint_interval_ticks;
        if checkpoint_every > 0 && self.tick_count % checkpoint_every == 0 {
            self.write_checkpoint(now);
        }

        report
    }

    async fn evaluate_symbol(&mut self, symbol: &str, now: DateTime<Utc>, report: &mut TickReport) {
        let spike = match self.detector.detect(&self.tracker, symbol) {
            Ok(Some(spike)) => spike,
            Ok(None) => return,
            Err(e) => {
                debug!(symbol, error = %e, "Spike detection skipped");
                return;
            }
        };
        report.spikes += 1;

        let market_ids: Vec<String> = self
            .config
            .markets_for(symbol)
            .map(|m| m.market_id.clone())
            .collect();

        for market_id in market_ids {
            let quote = self.fetch_quote(&market_id, report).await;
            let opportunity = match self.opportunities.evaluate(&spike, &market_id, quote) {
                Ok(Some(opp)) => opp,
                Ok(None) => continue,
                Err(e) => {
                    warn!(market = %market_id, error = %e, "Opportunity skipped");
                    continue;
                }
            };

            info!(
                symbol = %opportunity.symbol,
                market = %opportunity.market_id,
                direction = %opportunity.direction,
                magnitude = spike.magnitude,
                divergence = opportunity.divergence,
                expected_profit = opportunity.expected_profit,
                confidence = opportunity.confidence,
                quote = opportunity.quote_at_detection,
                "🎯 Opportunity"
            );

            if !self.cooldown.admit(&opportunity, now) {
                debug!(market = %market_id, "Opportunity in cooldown");
                continue;
            }

            let size = self.config.trading.position_size_usd;
            if let Err(e) = self.risk.can_open(size, now) {
                report.rejected += 1;
                warn!(market = %market_id, error = %e, "Open rejected by risk gate");
                continue;
            }

            match self.ledger.open(&opportunity, size, now) {
                Ok(position) => {
                    self.persist(&position, now);
                    report.opened.push(position);
                }
                Err(e @ EngineError::CapacityExceeded(_)) => {
                    report.rejected += 1;
                    info!(market = %market_id, error = %e, "Open rejected");
                }
                Err(e) => {
                    report.rejected += 1;
                    warn!(market = %market_id, error = %e, "Open failed");
                }
            }
        }
    }

    async fn monitor_positions(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        if self.ledger.open_count() == 0 {
            return;
        }

        let markets: BTreeSet<String> = self
            .ledger
            .open_positions()
            .into_iter()
            .map(|p| p.market_id)
            .collect();
        for market_id in &markets {
            self.fetch_quote(market_id, report).await;
        }

        let closed = self.risk.scan(&mut self.ledger, &self.quote_cache, now);
        self.book_closes(&closed, now);
        report.closed.extend(closed);
    }

    fn book_closes(&mut self, closed: &[Position], now: DateTime<Utc>) {
        for position in closed {
            self.stats.record_close(position);
            self.persist(position, now);
        }
    }

    fn persist(&mut self, position: &Position, now: DateTime<Utc>) {
        if let Err(e) = self.store.upsert(position, now) {
            error!(id = %position.position_id, error = %e, "Failed to persist position");
        }
    }

    pub fn current_stats(&self, now: DateTime<Utc>) -> TradingStats {
        let unrealized = self.ledger.unrealized_pnl(&self.quote_cache);
        self.stats
            .snapshot(unrealized, self.ledger.open_count(), now)
    }

    fn write_stats(&mut self, now: DateTime<Utc>) {
        let snapshot = self.current_stats(now);
        if let Err(e) = self.store.snapshot(&snapshot) {
            error!(error = %e, "Failed to write stats snapshot");
        }
    }

    fn write_checkpoint(&mut self, now: DateTime<Utc>) {
        let risk = self.risk.state().clone();
        if let Err(e) = self.store.checkpoint(&risk, &self.stats, now) {
            error!(error = %e, "Failed to write checkpoint");
        }
    }

    fn log_status(&self, now: DateTime<Utc>) {
        let s = self.current_stats(now);
        let risk = self.risk.state();
        info!(
            tick = self.tick_count,
            open = s.open_positions,
            balance = s.balance,
            equity = s.equity,
            realized = s.realized_pnl,
            unrealized = s.unrealized_pnl,
            loss_today = risk.realized_loss_today,
            soft_halt = risk.soft_halt,
            emergency = risk.emergency_triggered,
            durable = self.store.is_durable(),
            "📊 Status"
        );
        debug!("{}", self.stats.summary());
    }

    /// Drain: close everything at last known quote, flush stats and checkpoint
    pub async fn shutdown(&mut self, now: DateTime<Utc>) -> Vec<Position> {
        let mut report = TickReport::default();
        let markets: BTreeSet<String> = self
            .ledger
            .open_positions()
            .into_iter()
            .map(|p| p.market_id)
            .collect();
        for market_id in &markets {
            self.fetch_quote(market_id, &mut report).await;
        }

        let closed =
            self.risk
                .force_close_all(&mut self.ledger, &self.quote_cache, ExitReason::Manual, now);
        self.book_closes(&closed, now);

        self.write_stats(now);
        self.write_checkpoint(now);

        info!(closed = closed.len(), "🛑 Engine stopped");
        info!("Final statistics: {}", self.stats.summary());
        closed
    }

    /// Tick every `refresh_interval_seconds` until the shutdown signal flips
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let period = Duration::from_secs(self.config.engine.refresh_interval_seconds);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            refresh_secs = period.as_secs(),
            config = %self.config.digest(),
            "🚀 Engine running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if !report.opened.is_empty() || !report.closed.is_empty() {
                        debug!(
                            tick = report.tick,
                            opened = report.opened.len(),
                            closed = report.closed.len(),
                            rejected = report.rejected,
                            "Tick applied"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown(Utc::now()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineResult;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct ScriptedQuotes(Arc<Mutex<HashMap<String, f64>>>);

    impl ScriptedQuotes {
        fn set(&self, market: &str, quote: f64) {
            self.0.lock().unwrap().insert(market.to_string(), quote);
        }
        fn clear(&self) {
            self.0.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedQuotes {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_quote(&self, market_id: &str) -> EngineResult<f64> {
            self.0
                .lock()
                .unwrap()
                .get(market_id)
                .copied()
                .ok_or_else(|| EngineError::MissingQuote {
                    market_id: market_id.to_string(),
                })
        }
    }

    /// Answers from a scripted map until told to hang
    #[derive(Clone, Default)]
    struct HangingQuotes {
        inner: ScriptedQuotes,
        hang: Arc<AtomicBool>,
    }

    #[async_trait]
    impl QuoteSource for HangingQuotes {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn fetch_quote(&self, market_id: &str) -> EngineResult<f64> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.fetch_quote(market_id).await
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.trading.divergence_threshold = 0.01;
        cfg.engine.stats_interval_ticks = 0;
        cfg.persistence.checkpoint_interval_ticks = 0;
        cfg
    }

    fn engine(quotes: &ScriptedQuotes) -> (Engine, mpsc::Sender<PricePoint>) {
        let (tx, rx) = mpsc::channel(64);
        let engine = Engine::new(
            config(),
            Box::new(quotes.clone()),
            rx,
            PersistenceStore::in_memory(),
            t(0),
        );
        (engine, tx)
    }

    #[tokio::test]
    async fn spike_opens_and_take_profit_closes() {
        let quotes = ScriptedQuotes::default();
        quotes.set("btc-updown-15m", 0.35);
        let (mut engine, tx) = engine(&quotes);

        tx.send(PricePoint::new("BTC/USDT", 50_000.0, t(0))).await.unwrap();
        tx.send(PricePoint::new("BTC/USDT", 51_000.0, t(8))).await.unwrap();

        let report = engine.tick(t(8)).await;
        assert_eq!(report.prices_ingested, 2);
        assert_eq!(report.spikes, 1);
        assert_eq!(report.opened.len(), 1);
        assert_eq!(report.opened[0].entry_price, 0.35);
        assert_eq!(report.opened[0].size_usd, 100.0);

        quotes.set("btc-updown-15m", 0.70);
        let report = engine.tick(t(20)).await;
        assert_eq!(report.closed.len(), 1);
        let closed = &report.closed[0];
        assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
        assert!((closed.realized_pnl.unwrap() - 98.0).abs() < 1e-9);
        assert_eq!(engine.stats().trade_count(), 1);
    }

    #[tokio::test]
    async fn missing_quote_skips_without_opening() {
        let quotes = ScriptedQuotes::default();
        let (mut engine, tx) = engine(&quotes);

        tx.send(PricePoint::new("BTC/USDT", 50_000.0, t(0))).await.unwrap();
        tx.send(PricePoint::new("BTC/USDT", 51_000.0, t(8))).await.unwrap();

        let report = engine.tick(t(8)).await;
        assert_eq!(report.spikes, 1);
        assert!(report.opened.is_empty());
        assert_eq!(report.degraded_quotes, 1);
    }

    #[tokio::test]
    async fn degraded_quote_falls_back_to_cache() {
        let quotes = ScriptedQuotes::default();
        quotes.set("btc-updown-15m", 0.35);
        let (mut engine, tx) = engine(&quotes);

        tx.send(PricePoint::new("BTC/USDT", 50_000.0, t(0))).await.unwrap();
        tx.send(PricePoint::new("BTC/USDT", 51_000.0, t(8))).await.unwrap();
        engine.tick(t(8)).await;
        assert_eq!(engine.ledger().open_count(), 1);

        // Quote source goes dark; the position is held on the cached quote
        quotes.clear();
        let report = engine.tick(t(30)).await;
        assert_eq!(report.degraded_quotes, 1);
        assert!(report.closed.is_empty());

        // Hold time still applies, at the last known quote
        let report = engine.tick(t(8 + 870)).await;
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].exit_reason, Some(ExitReason::MaxHoldTime));
        assert_eq!(report.closed[0].exit_price, Some(0.35));
    }

    #[tokio::test]
    async fn shutdown_closes_everything_as_manual() {
        let quotes = ScriptedQuotes::default();
        quotes.set("btc-updown-15m", 0.35);
        let (mut engine, tx) = engine(&quotes);

        tx.send(PricePoint::new("BTC/USDT", 50_000.0, t(0))).await.unwrap();
        tx.send(PricePoint::new("BTC/USDT", 51_000.0, t(8))).await.unwrap();
        engine.tick(t(8)).await;

        quotes.set("btc-updown-15m", 0.40);
        let closed = engine.shutdown(t(12)).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::Manual));
        assert_eq!(closed[0].exit_price, Some(0.40));
        assert_eq!(engine.ledger().open_count(), 0);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown_signal() {
        let quotes = ScriptedQuotes::default();
        let (engine, _tx) = engine(&quotes);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(engine.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn hung_quote_source_times_out_onto_cache() {
        let quotes = HangingQuotes::default();
        quotes.inner.set("btc-updown-15m", 0.35);
        let (tx, rx) = mpsc::channel(64);
        let mut cfg = config();
        cfg.engine.fetch_timeout_ms = 50;
        let mut engine = Engine::new(
            cfg,
            Box::new(quotes.clone()),
            rx,
            PersistenceStore::in_memory(),
            t(0),
        );

        tx.send(PricePoint::new("BTC/USDT", 50_000.0, t(0))).await.unwrap();
        tx.send(PricePoint::new("BTC/USDT", 51_000.0, t(8))).await.unwrap();
        engine.tick(t(8)).await;
        assert_eq!(engine.ledger().open_count(), 1);

        quotes.hang.store(true, Ordering::SeqCst);
        let started = std::time::Instant::now();
        let report = engine.tick(t(30)).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(report.degraded_quotes, 1);
        assert!(report.closed.is_empty());

        let report = engine.tick(t(8 + 870)).await;
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].exit_reason, Some(ExitReason::MaxHoldTime));
        assert_eq!(report.closed[0].exit_price, Some(0.35));
    }

    #[tokio::test]
    async fn stale_feed_is_flagged_once_until_it_recovers() {
        let quotes = ScriptedQuotes::default();
        let (mut engine, tx) = engine(&quotes);

        tx.send(PricePoint::new("BTC/USDT", 50_000.0, t(0))).await.unwrap();
        let report = engine.tick(t(0)).await;
        assert_eq!(report.stale_feeds, 0);
        assert!(!engine.is_stale("BTC/USDT"));

        // Default stale_feed_seconds is 30
        assert_eq!(engine.tick(t(29)).await.stale_feeds, 0);
        assert_eq!(engine.tick(t(30)).await.stale_feeds, 1);
        assert!(engine.is_stale("BTC/USDT"));
        assert_eq!(engine.tick(t(45)).await.stale_feeds, 0);
        assert!(engine.is_stale("BTC/USDT"));

        tx.send(PricePoint::new("BTC/USDT", 50_010.0, t(46))).await.unwrap();
        let report = engine.tick(t(46)).await;
        assert_eq!(report.prices_ingested, 1);
        assert_eq!(report.stale_feeds, 0);
        assert!(!engine.is_stale("BTC/USDT"));

        // A second silent episode is reported again
        assert_eq!(engine.tick(t(80)).await.stale_feeds, 1);
    }
}
