//! Spot price ingestion
//!
//! - `history`: rolling per-symbol window
//! - `spike`: rapid-move detection over that window
//! - `PriceFeed` / `QuoteSource`: the seams to external price and market clients
//! - `spawn_price_producer`: one task per feed, pushing into the engine channel

pub mod history;
pub mod spike;

pub use history::PriceHistoryTracker;
pub use spike::{Spike, SpikeDetector};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::PricePoint;

/// Source of spot prices (exchange stream, simulator, replay file)
#[async_trait]
pub trait PriceFeed: Send {
    /// Get the source name
    fn name(&self) -> &str;

    /// Wait for the next price. `FeedUnavailable` on disconnect or bad payload.
    async fn next_price(&mut self) -> EngineResult<PricePoint>;
}

/// Source of prediction-market quotes, as the "up" probability in [0, 1]
#[async_trait]
pub trait QuoteSource: Send + Sync {
    fn name(&self) -> &str;

    /// Current quote for a market. `MissingQuote` when it has none.
    async fn fetch_quote(&self, market_id: &str) -> EngineResult<f64>;
}

/// Doubling retry delay, capped
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Producer task settings
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub fetch_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

/// Run a feed until shutdown, forwarding every price into the engine channel.
///
/// Failures and timeouts are retried with exponential backoff. The producer
/// never touches engine state; it only sends.
pub fn spawn_price_producer(
    mut feed: Box<dyn PriceFeed>,
    tx: mpsc::Sender<PricePoint>,
    settings: ProducerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = ExponentialBackoff::new(settings.retry_initial, settings.retry_max);
        let name = feed.name().to_string();
        info!(feed = %name, "Price producer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = tokio::select! {
                _ = shutdown.changed() => break,
                r = tokio::time::timeout(settings.fetch_timeout, feed.next_price()) => r,
            };

            let err = match result {
                Ok(Ok(point)) => {
                    backoff.reset();
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        sent = tx.send(point) => {
                            if sent.is_err() {
                                debug!(feed = %name, "Engine channel closed");
                                break;
                            }
                        }
                    }
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => EngineError::FeedUnavailable {
                    source_name: name.clone(),
                    reason: format!("no price within {:?}", settings.fetch_timeout),
                },
            };

            let delay = backoff.next_delay();
            warn!(
                feed = %name,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Price feed degraded"
            );

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(feed = %name, "Price producer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyFeed {
        calls: u32,
    }

    #[async_trait]
    impl PriceFeed for FlakyFeed {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn next_price(&mut self) -> EngineResult<PricePoint> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                Err(EngineError::FeedUnavailable {
                    source_name: "flaky".into(),
                    reason: "socket reset".into(),
                })
            } else {
                Ok(PricePoint::new("BTC/USDT", 50_000.0 + self.calls as f64, Utc::now()))
            }
        }
    }

    /// Never answers its first call
    struct StallingFeed {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl PriceFeed for StallingFeed {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn next_price(&mut self) -> EngineResult<PricePoint> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(PricePoint::new("ETH/USDT", 3_000.0, Utc::now()))
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_millis(3000));
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn producer_retries_and_stops_on_shutdown() {
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = ProducerSettings {
            fetch_timeout: Duration::from_millis(200),
            retry_initial: Duration::from_millis(1),
            retry_max: Duration::from_millis(4),
        };

        let handle = spawn_price_producer(
            Box::new(FlakyFeed { calls: 0 }),
            tx,
            settings,
            shutdown_rx,
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.symbol, "BTC/USDT");
        assert!(second.price > first.price);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn producer_times_out_stalled_feed_and_retries() {
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let settings = ProducerSettings {
            fetch_timeout: Duration::from_millis(30),
            retry_initial: Duration::from_millis(1),
            retry_max: Duration::from_millis(4),
        };

        let started = std::time::Instant::now();
        let handle = spawn_price_producer(
            Box::new(StallingFeed {
                calls: calls.clone(),
            }),
            tx,
            settings,
            shutdown_rx,
        );

        let point = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("producer should recover from the stalled call")
            .unwrap();
        assert_eq!(point.symbol, "ETH/USDT");
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(calls.load(Ordering::SeqCst) >= 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
