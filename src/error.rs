//! Engine error taxonomy
//!
//! Every recoverable failure the decision engine can hit is a variant here.
//! The tick loop decides per variant whether to retry, skip, degrade or abort:
//! - `FeedUnavailable`: producer retries with backoff, tick runs on stale data
//! - `MissingQuote`: opportunity skipped, logged
//! - `InvalidConfiguration`: startup aborts
//! - `PersistenceWriteFailure`: store degrades to in-memory only
//! - `CapacityExceeded`: open rejected, logged, never escalated

use std::fmt;
use thiserror::Error;

/// Why a new position was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Open position count already at `max_positions`
    MaxPositions,
    /// Requested size above `max_position_size_usd`
    PositionTooLarge,
    /// Same (symbol, market, direction) already open inside the cooldown
    DuplicateKey,
    /// Daily loss limit hit, trading resumes next UTC day
    DailyLossLimit,
    /// Position size above what is left of today's loss budget
    InsufficientRiskBudget,
    /// Emergency shutdown active until operator reset
    EmergencyShutdown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MaxPositions => write!(f, "max_positions_reached"),
            RejectReason::PositionTooLarge => write!(f, "position_too_large"),
            RejectReason::DuplicateKey => write!(f, "duplicate_open_position"),
            RejectReason::DailyLossLimit => write!(f, "daily_loss_limit_reached"),
            RejectReason::InsufficientRiskBudget => write!(f, "insufficient_risk_budget"),
            RejectReason::EmergencyShutdown => write!(f, "emergency_shutdown_active"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    /// Price feed could not deliver (disconnect, timeout, bad payload).
    #[error("price feed {source_name} unavailable: {reason}")]
    FeedUnavailable { source_name: String, reason: String },

    /// No usable quote for a market.
    #[error("no quote available for market {market_id}")]
    MissingQuote { market_id: String },

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Durable write failed after all retries.
    #[error("persistence write failed after {attempts} attempts: {reason}")]
    PersistenceWriteFailure { attempts: u32, reason: String },

    /// New position refused by a capacity or risk limit.
    #[error("cannot open position: {0}")]
    CapacityExceeded(RejectReason),

    /// Symbol has never been seen by the price tracker.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Price or quote outside its valid domain.
    #[error("invalid price {value} for {context}")]
    InvalidPrice { context: String, value: f64 },

    #[error("position {0} not found")]
    PositionNotFound(String),

    #[error("position {0} is already closed")]
    PositionClosed(String),
}

impl EngineError {
    /// Errors the tick loop logs and moves past.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::InvalidConfiguration(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
