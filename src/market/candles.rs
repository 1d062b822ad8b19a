use crate::market::types::{Candle, Tick};

pub fn candle_bucket_open_time(timestamp_ms: i64, bucket_ms: i64) -> i64 {
    if bucket_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms - timestamp_ms.rem_euclid(bucket_ms)
}

/// Builds `count` epoch-aligned candles covering `[now_bucket - count*bucket, now_bucket)`.
///
/// Once a previous close is known, every bucket opens at it; empty buckets
/// carry it forward as a flat candle, so the series has no holes and agrees
/// with [`apply_live_tick`]. Buckets before any known
/// price are omitted. Pass `now_ms + bucket_ms` to include the in-progress bucket.
pub fn build_candles(ticks: &[Tick], bucket_ms: i64, count: usize, now_ms: i64) -> Vec<Candle> {
    if bucket_ms <= 0 || count == 0 {
        return Vec::new();
    }

    let mut sorted: Vec<Tick> = ticks.iter().copied().filter(Tick::is_valid).collect();
    sorted.sort_by_key(|tick| tick.t);

    let window_end = candle_bucket_open_time(now_ms, bucket_ms);
    let window_start = window_end.saturating_sub(bucket_ms.saturating_mul(count as i64));

    let mut cursor = 0;
    let mut last_close: Option<f64> = None;
    while cursor < sorted.len() && sorted[cursor].t < window_start {
        last_close = Some(sorted[cursor].p);
        cursor += 1;
    }

    let mut candles = Vec::with_capacity(count);
    for step in 0..count as i64 {
        let bucket_start = window_start + step * bucket_ms;
        let bucket_end = bucket_start + bucket_ms;
        let time = bucket_start.div_euclid(1_000);

        let mut bucket: Option<Candle> = None;
        let mut tick_count = 0_u32;
        while cursor < sorted.len() && sorted[cursor].t < bucket_end {
            let price = sorted[cursor].p;
            match bucket.as_mut() {
                Some(candle) => candle.apply_price(price),
                None => {
                    let mut candle = Candle::flat(time, last_close.unwrap_or(price));
                    candle.apply_price(price);
                    bucket = Some(candle);
                }
            }
            tick_count += 1;
            cursor += 1;
        }

        match bucket {
            Some(mut candle) => {
                candle.volume = Some(f64::from(tick_count));
                last_close = Some(candle.close);
                candles.push(candle);
            }
            None => {
                if let Some(close) = last_close {
                    candles.push(Candle::flat(time, close));
                }
            }
        }
    }

    candles.retain(Candle::is_valid);
    candles
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
    /// No base series yet; wait for a fetch or build.
    NoBase,
    Mutated(Candle),
    Opened(Candle),
    /// Tick belongs to a bucket older than the tail or carries an unusable price.
    Ignored,
}

/// Folds one accepted tick into the tail of `series`.
///
/// At most one candle is appended per tick; skipped buckets are left for the
/// next full rebuild to carry forward.
pub fn apply_live_tick(series: &mut Vec<Candle>, price: f64, now_ms: i64, bucket_ms: i64) -> LiveUpdate {
    if !price.is_finite() || price <= 0.0 {
        return LiveUpdate::Ignored;
    }
    let Some(last) = series.last_mut() else {
        return LiveUpdate::NoBase;
    };

    let bucket_time = candle_bucket_open_time(now_ms, bucket_ms).div_euclid(1_000);
    if bucket_time == last.time {
        last.apply_price(price);
        return LiveUpdate::Mutated(*last);
    }
    if bucket_time < last.time {
        return LiveUpdate::Ignored;
    }

    let open = last.close;
    let next = Candle {
        time: bucket_time,
        open,
        high: open.max(price),
        low: open.min(price),
        close: price,
        volume: None,
    };
    series.push(next);
    LiveUpdate::Opened(next)
}
