use crate::market::types::Tick;
use std::collections::{HashMap, VecDeque};

/// Bounded per-instrument tick buffer. Oldest samples are evicted first.
#[derive(Debug)]
pub struct TickStore {
    capacity: usize,
    buffers: HashMap<String, VecDeque<Tick>>,
}

impl TickStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `false` when the sample is rejected (non-positive or non-finite price).
    pub fn push(&mut self, instrument: &str, tick: Tick) -> bool {
        if !tick.is_valid() {
            return false;
        }

        let capacity = self.capacity;
        let buffer = self
            .buffers
            .entry(instrument.to_string())
            .or_insert_with(|| VecDeque::with_capacity(capacity.min(1_024)));
        while buffer.len() >= capacity {
            buffer.pop_front();
        }
        buffer.push_back(tick);
        true
    }

    pub fn ticks(&self, instrument: &str) -> Vec<Tick> {
        self.buffers
            .get(instrument)
            .map(|buffer| buffer.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn last(&self, instrument: &str) -> Option<Tick> {
        self.buffers
            .get(instrument)
            .and_then(|buffer| buffer.back().copied())
    }

    pub fn len(&self, instrument: &str) -> usize {
        self.buffers.get(instrument).map(VecDeque::len).unwrap_or(0)
    }

    /// Seeds a buffer from the session cache; live samples already present win.
    pub fn restore(&mut self, instrument: &str, ticks: Vec<Tick>) {
        let live = self.buffers.remove(instrument).unwrap_or_default();
        for tick in ticks.into_iter().chain(live) {
            self.push(instrument, tick);
        }
    }

    pub fn instruments(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
