use crate::error::AppError;
use crate::market::cache::CacheEntry;
use crate::market::types::{ChartKey, Tick, Timeframe};
use sqlx::{Row, SqlitePool};

/// Session rows older than this are neither restored nor kept.
pub const SESSION_CACHE_TTL_MS: i64 = 6 * 60 * 60 * 1_000;

fn map_cache_row(row: &sqlx::sqlite::SqliteRow) -> Result<(ChartKey, CacheEntry), AppError> {
    let instrument: String = row.try_get("instrument")?;
    let timeframe_raw: String = row.try_get("timeframe")?;
    let entry_json: String = row.try_get("entry_json")?;

    let mut entry_bytes = entry_json.into_bytes();
    let entry = simd_json::serde::from_slice::<CacheEntry>(&mut entry_bytes)?;
    Ok((
        ChartKey::new(instrument, Timeframe::parse_str(&timeframe_raw)?),
        entry,
    ))
}

/// Replaces the stored ticks of `instrument` with `ticks`.
pub async fn save_session_ticks(
    pool: &SqlitePool,
    instrument: &str,
    ticks: &[Tick],
    now_ms: i64,
) -> Result<usize, AppError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM session_ticks WHERE instrument = ?")
        .bind(instrument)
        .execute(&mut *tx)
        .await?;

    let mut saved = 0_usize;
    for (seq, tick) in ticks.iter().filter(|tick| tick.is_valid()).enumerate() {
        sqlx::query(
            "INSERT INTO session_ticks (instrument, seq, t, p, saved_at_ms) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(instrument)
        .bind(seq as i64)
        .bind(tick.t)
        .bind(tick.p)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
        saved += 1;
    }

    tx.commit().await?;
    Ok(saved)
}

pub async fn load_session_ticks(
    pool: &SqlitePool,
    instrument: &str,
    now_ms: i64,
) -> Result<Vec<Tick>, AppError> {
    let rows = sqlx::query(
        "SELECT t, p FROM session_ticks WHERE instrument = ? AND saved_at_ms >= ? ORDER BY seq ASC",
    )
    .bind(instrument)
    .bind(now_ms - SESSION_CACHE_TTL_MS)
    .fetch_all(pool)
    .await?;

    let mut ticks = Vec::with_capacity(rows.len());
    for row in rows {
        let tick = Tick {
            t: row.try_get("t")?,
            p: row.try_get("p")?,
        };
        if tick.is_valid() {
            ticks.push(tick);
        }
    }

    Ok(ticks)
}

pub async fn save_cache_entry(
    pool: &SqlitePool,
    key: &ChartKey,
    entry: &CacheEntry,
    now_ms: i64,
) -> Result<(), AppError> {
    let entry_json = simd_json::to_string(entry)?;
    sqlx::query(
        "INSERT INTO session_candles (instrument, timeframe, fetched_at_ms, entry_json, saved_at_ms) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(instrument, timeframe) DO UPDATE SET fetched_at_ms=excluded.fetched_at_ms, entry_json=excluded.entry_json, saved_at_ms=excluded.saved_at_ms",
    )
    .bind(&key.instrument)
    .bind(key.timeframe.as_str())
    .bind(entry.fetched_at)
    .bind(entry_json)
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_cache_entries(
    pool: &SqlitePool,
    instrument: &str,
    now_ms: i64,
) -> Result<Vec<(ChartKey, CacheEntry)>, AppError> {
    let rows = sqlx::query(
        "SELECT instrument, timeframe, entry_json FROM session_candles \
         WHERE instrument = ? AND saved_at_ms >= ? \
         ORDER BY timeframe ASC",
    )
    .bind(instrument)
    .bind(now_ms - SESSION_CACHE_TTL_MS)
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(map_cache_row(&row)?);
    }

    Ok(entries)
}

/// Drops expired rows from both tables and returns how many went.
pub async fn prune_session_cache(pool: &SqlitePool, now_ms: i64) -> Result<u64, AppError> {
    let cutoff = now_ms - SESSION_CACHE_TTL_MS;
    let ticks = sqlx::query("DELETE FROM session_ticks WHERE saved_at_ms < ?")
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();
    let candles = sqlx::query("DELETE FROM session_candles WHERE saved_at_ms < ?")
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();

    Ok(ticks + candles)
}
