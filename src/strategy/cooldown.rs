//! Per-key deduplication of opportunities

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::opportunity::Opportunity;
use crate::types::Direction;

type CooldownKey = (String, String, Direction);

/// Lets one opportunity per (symbol, market_id, direction) through per cooldown
#[derive(Debug, Clone)]
pub struct CooldownFilter {
    cooldown: Duration,
    last_fired: HashMap<CooldownKey, DateTime<Utc>>,
}

impl CooldownFilter {
    pub fn new(cooldown_seconds: u64) -> Self {
        Self {
            cooldown: Duration::seconds(cooldown_seconds as i64),
            last_fired: HashMap::new(),
        }
    }

    pub fn admit(&mut self, opportunity: &Opportunity, now: DateTime<Utc>) -> bool {
        self.gc(now);

        let key = opportunity.key();
        if let Some(last) = self.last_fired.get(&key) {
            if now - *last < self.cooldown {
                return false;
            }
        }
        self.last_fired.insert(key, now);
        true
    }

    /// Mark a key as fired without an opportunity, e.g. for positions restored
    /// after restart.
    pub fn mark(&mut self, symbol: &str, market_id: &str, direction: Direction, at: DateTime<Utc>) {
        let key = (symbol.to_string(), market_id.to_string(), direction);
        let entry = self.last_fired.entry(key).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    fn gc(&mut self, now: DateTime<Utc>) {
        let horizon = self.cooldown * 2;
        self.last_fired.retain(|_, last| now - *last <= horizon);
    }

    pub fn tracked(&self) -> usize {
        self.last_fired.len()
    }
}
