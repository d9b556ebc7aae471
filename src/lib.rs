//! PolySpike Library
//!
//! Spike/divergence decision engine for Polymarket up/down crypto markets.
//! Paper mode only: it decides what to do and records what happened.

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod persistence;
pub mod risk;
pub mod sim;
pub mod strategy;
pub mod types;

pub use config::AppConfig;
pub use engine::{Engine, TickReport};
pub use error::{EngineError, EngineResult, RejectReason};
