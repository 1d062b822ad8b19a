use crate::market::candles::candle_bucket_open_time;
use crate::market::types::Candle;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SYNTHETIC_PRICE_FLOOR: f64 = 0.000_01;
const MAX_DRIFT_RATIO: f64 = 0.000_8;
const MAX_WICK_RATIO: f64 = 0.000_3;
const FALLBACK_SEED_PRICE: f64 = 1.0;

/// FNV-1a over the key bytes; stable across runs and platforms.
pub fn seed_for_key(key: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

/// Deterministic random walk ending at the bucket before `now_ms`.
///
/// Only a visual placeholder: the engine labels this output as simulated.
pub fn synthetic_candles(
    seed_price: f64,
    bucket_ms: i64,
    count: usize,
    key: &str,
    now_ms: i64,
) -> Vec<Candle> {
    if bucket_ms <= 0 || count == 0 {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(seed_for_key(key));
    let aligned_now = candle_bucket_open_time(now_ms, bucket_ms);
    let start = aligned_now - count as i64 * bucket_ms;
    let mut close = if seed_price.is_finite() && seed_price > 0.0 {
        seed_price
    } else {
        FALLBACK_SEED_PRICE
    };

    let mut candles = Vec::with_capacity(count);
    for step in 0..count as i64 {
        let open = close;
        let drift = rng.gen_range(-MAX_DRIFT_RATIO..=MAX_DRIFT_RATIO) * open;
        close = (open + drift).max(SYNTHETIC_PRICE_FLOOR);
        let upper_wick = rng.gen_range(0.0..=MAX_WICK_RATIO) * open;
        let lower_wick = rng.gen_range(0.0..=MAX_WICK_RATIO) * open;
        let high = open.max(close) + upper_wick;
        let low = (open.min(close) - lower_wick).max(SYNTHETIC_PRICE_FLOOR);

        candles.push(Candle {
            time: (start + step * bucket_ms).div_euclid(1_000),
            open,
            high,
            low,
            close,
            volume: None,
        });
    }

    candles
}
