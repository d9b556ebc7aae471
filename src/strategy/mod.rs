//! Strategy: turns spikes into tradeable opportunities
//!
//! Polymarket up/down markets reprice slower than the exchange spot feed.
//! A spot spike the market quote has not followed yet is the edge:
//! - `opportunity`: divergence and expected-profit gates
//! - `cooldown`: one signal per (symbol, market, direction) per window

pub mod cooldown;
pub mod opportunity;

pub use cooldown::CooldownFilter;
pub use opportunity::{Opportunity, OpportunityEngine};
