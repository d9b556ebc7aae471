//! Risk Controller - exit policy and loss limits
//!
//! Implements:
//! - Stop-loss / take-profit on quote-space pnl
//! - Max hold time
//! - Daily loss limit (soft halt until next UTC day)
//! - Cumulative loss ceiling (emergency shutdown until operator reset)

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::config::RiskConfig;
use crate::error::{EngineError, EngineResult, RejectReason};
use crate::ledger::{Position, PositionLedger};
use crate::types::{at_or_above, at_or_below, ExitReason, THRESHOLD_EPSILON};

/// Loss accounting for the current UTC day plus the sticky emergency state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRiskState {
    pub date: NaiveDate,
    pub realized_loss_today: f64,
    pub soft_halt: bool,
    pub emergency_triggered: bool,
    /// All-time realized losses
    #[serde(default)]
    pub cumulative_loss: f64,
}

impl DailyRiskState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            realized_loss_today: 0.0,
            soft_halt: false,
            emergency_triggered: false,
            cumulative_loss: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct RiskController {
    config: RiskConfig,
    state: DailyRiskState,
}

impl RiskController {
    pub fn new(config: RiskConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            state: DailyRiskState::new(now.date_naive()),
        }
    }

    pub fn state(&self) -> &DailyRiskState {
        &self.state
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Adopt persisted state after restart
    pub fn restore_state(&mut self, state: DailyRiskState) {
        info!(
            date = %state.date,
            loss_today = state.realized_loss_today,
            cumulative_loss = state.cumulative_loss,
            soft_halt = state.soft_halt,
            emergency = state.emergency_triggered,
            "Restored risk state"
        );
        self.state = state;
    }

    /// Reset per-day counters when the UTC date changes. Emergency and
    /// cumulative loss survive.
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        self.roll_to(now.date_naive())
    }

    fn roll_to(&mut self, day: NaiveDate) -> bool {
        if day <= self.state.date {
            return false;
        }
        if self.state.soft_halt {
            info!(date = %day, "New trading day, daily loss halt lifted");
        }
        self.state.date = day;
        self.state.realized_loss_today = 0.0;
        self.state.soft_halt = false;
        true
    }

    /// Gate for a new position of `size_usd`
    pub fn can_open(&self, size_usd: f64, now: DateTime<Utc>) -> EngineResult<()> {
        if self.state.emergency_triggered {
            return Err(EngineError::CapacityExceeded(RejectReason::EmergencyShutdown));
        }

        let same_day = self.state.date == now.date_naive();
        if self.state.soft_halt && same_day {
            return Err(EngineError::CapacityExceeded(RejectReason::DailyLossLimit));
        }

        let loss_today = if same_day { self.state.realized_loss_today } else { 0.0 };
        let remaining = self.config.max_daily_loss_usd - loss_today;
        if size_usd > remaining + THRESHOLD_EPSILON {
            warn!(
                size = size_usd,
                remaining,
                "Position size exceeds remaining daily risk budget"
            );
            return Err(EngineError::CapacityExceeded(
                RejectReason::InsufficientRiskBudget,
            ));
        }
        Ok(())
    }

    pub fn reset_emergency(&mut self) {
        if self.state.emergency_triggered {
            warn!(
                cumulative_loss = self.state.cumulative_loss,
                "Emergency shutdown reset by operator"
            );
        }
        self.state.emergency_triggered = false;
        self.state.cumulative_loss = 0.0;
    }

    /// Decide whether a position should close, and at what quote.
    ///
    /// `quote` is the best known quote for the position's market. Without
    /// one only the hold-time exit applies, at entry price.
    pub fn evaluate_exit(
        &self,
        position: &Position,
        quote: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<(ExitReason, f64)> {
        if let Some(q) = quote {
            let pnl_pct = position.pnl_pct(q);
            if at_or_below(pnl_pct, -self.config.stop_loss_pct) {
                return Some((ExitReason::StopLoss, q));
            }
            if at_or_above(pnl_pct, self.config.take_profit_pct) {
                return Some((ExitReason::TakeProfit, q));
            }
        }

        let held = position.age(now).num_seconds();
        if held >= self.config.max_hold_time_seconds as i64 {
            return Some((ExitReason::MaxHoldTime, quote.unwrap_or(position.entry_price)));
        }

        None
    }

    /// Book a closed position against the loss limits.
    ///
    /// The loss counts toward the daily limit of the UTC day it was realized
    /// on. A close from a later day rolls the state forward first; one from an
    /// earlier day only feeds the cumulative total.
    pub fn record_close(&mut self, position: &Position) {
        let pnl = position.realized_pnl.unwrap_or(0.0);
        if pnl >= 0.0 {
            return;
        }

        let day = position
            .exit_time
            .map(|t| t.date_naive())
            .unwrap_or(self.state.date);
        self.roll_to(day);

        let loss = -pnl;
        self.state.cumulative_loss += loss;
        if day == self.state.date {
            self.state.realized_loss_today += loss;
        }

        if !self.state.soft_halt
            && at_or_above(self.state.realized_loss_today, self.config.max_daily_loss_usd)
        {
            self.state.soft_halt = true;
            warn!(
                loss_today = self.state.realized_loss_today,
                limit = self.config.max_daily_loss_usd,
                "Daily loss limit reached, new positions halted until next UTC day"
            );
        }

        if !self.state.emergency_triggered
            && at_or_above(
                self.state.cumulative_loss,
                self.config.emergency_shutdown_loss_usd,
            )
        {
            self.state.emergency_triggered = true;
            error!(
                cumulative_loss = self.state.cumulative_loss,
                limit = self.config.emergency_shutdown_loss_usd,
                "🚨 EMERGENCY SHUTDOWN: cumulative loss ceiling reached"
            );
        }
    }

    /// One pass over every OPEN position. Returns the positions closed.
    pub fn scan(
        &mut self,
        ledger: &mut PositionLedger,
        quotes: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<Position> {
        self.roll_day(now);

        let mut closed = Vec::new();
        for position in ledger.open_positions() {
            let quote = quotes.get(&position.market_id).copied();
            let Some((reason, exit_price)) = self.evaluate_exit(&position, quote, now) else {
                continue;
            };
            match ledger.close(&position.position_id, exit_price, reason, now) {
                Ok(done) => {
                    self.record_close(&done);
                    closed.push(done);
                }
                Err(e) => warn!(id = %position.position_id, error = %e, "Close failed"),
            }
        }

        if self.state.emergency_triggered && ledger.open_count() > 0 {
            closed.extend(self.force_close_all(
                ledger,
                quotes,
                ExitReason::EmergencyShutdown,
                now,
            ));
        }

        closed
    }

    /// Close everything at the last known quote (entry price if none)
    pub fn force_close_all(
        &mut self,
        ledger: &mut PositionLedger,
        quotes: &HashMap<String, f64>,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Vec<Position> {
        let mut closed = Vec::new();
        for position in ledger.open_positions() {
            let exit_price = quotes
                .get(&position.market_id)
                .copied()
                .unwrap_or(position.entry_price);
            match ledger.close(&position.position_id, exit_price, reason, now) {
                Ok(done) => {
                    self.record_close(&done);
                    closed.push(done);
                }
                Err(e) => warn!(id = %position.position_id, error = %e, "Forced close failed"),
            }
        }
        if !closed.is_empty() {
            warn!(count = closed.len(), reason = %reason, "Force-closed open positions");
        }
        closed
    }
}
