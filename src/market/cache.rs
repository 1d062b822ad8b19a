use crate::market::types::{Candle, CandleSource, ChartKey, Timeframe};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const MIN_FRESHNESS_WINDOW_MS: u64 = 20_000;
pub const MAX_FRESHNESS_WINDOW_MS: u64 = 300_000;

/// `clamp(20s, 5min, 2 × base poll interval)`.
pub fn freshness_window(timeframe: Timeframe) -> Duration {
    let window_ms = timeframe
        .base_poll_interval_ms()
        .saturating_mul(2)
        .clamp(MIN_FRESHNESS_WINDOW_MS, MAX_FRESHNESS_WINDOW_MS);
    Duration::from_millis(window_ms)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub fetched_at: i64,
    pub candles: Vec<Candle>,
    pub source: CandleSource,
}

impl CacheEntry {
    /// Locally built series never count as fresh so they cannot suppress a fetch.
    pub fn is_fresh(&self, timeframe: Timeframe, now_ms: i64) -> bool {
        if self.source != CandleSource::Live {
            return false;
        }
        let age_ms = now_ms.saturating_sub(self.fetched_at);
        age_ms >= 0 && (age_ms as u128) < freshness_window(timeframe).as_millis()
    }
}

#[derive(Debug, Default)]
pub struct CandleCache {
    entries: HashMap<ChartKey, CacheEntry>,
}

impl CandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ChartKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: ChartKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// True when the network fetch can be skipped for `key`.
    pub fn should_skip_fetch(&self, key: &ChartKey, now_ms: i64, force: bool) -> bool {
        if force {
            return false;
        }
        self.entries
            .get(key)
            .map(|entry| entry.is_fresh(key.timeframe, now_ms))
            .unwrap_or(false)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ChartKey, &CacheEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
