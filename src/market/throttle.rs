use parking_lot::RwLock;
use std::collections::HashMap;

pub const MIN_PUSH_INTERVAL_MS: i64 = 8_000;
pub const PRICE_EPSILON: f64 = 0.000_01;

/// Source of truth for whether an instrument has open positions.
pub trait OpenPositions: Send + Sync {
    fn open_position_count(&self, instrument: &str) -> usize;
}

/// Position counts maintained by the host as trades open and close.
#[derive(Debug, Default)]
pub struct PositionBook {
    counts: RwLock<HashMap<String, usize>>,
}

impl PositionBook {
    pub fn set_open_positions(&self, instrument: &str, count: usize) {
        let mut writable = self.counts.write();
        if count == 0 {
            writable.remove(instrument);
        } else {
            writable.insert(instrument.to_string(), count);
        }
    }
}

impl OpenPositions for PositionBook {
    fn open_position_count(&self, instrument: &str) -> usize {
        self.counts.read().get(instrument).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PushDecision {
    Push,
    NoOpenPosition,
    TooSoon { remaining_ms: i64 },
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
struct PushRecord {
    at_ms: i64,
    price: f64,
}

#[derive(Debug)]
pub struct PricePushThrottler {
    min_interval_ms: i64,
    epsilon: f64,
    last_push: HashMap<String, PushRecord>,
}

impl Default for PricePushThrottler {
    fn default() -> Self {
        Self::new(MIN_PUSH_INTERVAL_MS, PRICE_EPSILON)
    }
}

impl PricePushThrottler {
    pub fn new(min_interval_ms: i64, epsilon: f64) -> Self {
        Self {
            min_interval_ms,
            epsilon,
            last_push: HashMap::new(),
        }
    }

    /// Decides whether `price` should be reported; a `Push` decision is recorded.
    pub fn evaluate(
        &mut self,
        instrument: &str,
        price: f64,
        open_positions: usize,
        now_ms: i64,
    ) -> PushDecision {
        if open_positions == 0 {
            return PushDecision::NoOpenPosition;
        }

        if let Some(last) = self.last_push.get(instrument) {
            let elapsed_ms = now_ms.saturating_sub(last.at_ms);
            if elapsed_ms < self.min_interval_ms {
                return PushDecision::TooSoon {
                    remaining_ms: self.min_interval_ms - elapsed_ms,
                };
            }
            if (price - last.price).abs() < self.epsilon {
                return PushDecision::Unchanged;
            }
        }

        self.last_push.insert(
            instrument.to_string(),
            PushRecord {
                at_ms: now_ms,
                price,
            },
        );
        PushDecision::Push
    }

    pub fn clear(&mut self) {
        self.last_push.clear();
    }
}
