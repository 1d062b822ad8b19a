use crate::error::AppError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_INSTRUMENT: &str = "EURUSD";
pub const DEFAULT_TIMEFRAME: Timeframe = Timeframe::M5;
pub const DEFAULT_HISTORY_LIMIT: u16 = 300;
pub const DEFAULT_EMIT_INTERVAL_MS: u64 = 16;
pub const DEFAULT_TICK_CAPACITY: usize = 5_000;
pub const DEFAULT_SEED_PRICE: f64 = 1.0;
pub const MIN_HISTORY_LIMIT: u16 = 50;
pub const MAX_HISTORY_LIMIT: u16 = 1_500;
pub const MIN_EMIT_INTERVAL_MS: u64 = 8;
pub const MAX_EMIT_INTERVAL_MS: u64 = 1_000;
pub const MIN_TICK_CAPACITY: usize = 100;
pub const MAX_TICK_CAPACITY: usize = 20_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported timeframe '{other}'"
            ))),
        }
    }

    pub fn bucket_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
        }
    }

    /// Polling cadence for REST refreshes while the chart is visible.
    pub fn base_poll_interval_ms(self) -> u64 {
        match self {
            Self::M1 => 15_000,
            Self::M5 => 30_000,
            Self::M15 => 60_000,
            Self::M30 => 90_000,
            Self::H1 => 120_000,
            Self::H4 => 300_000,
            Self::D1 => 600_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub t: i64,
    pub p: f64,
}

impl Tick {
    pub fn is_valid(&self) -> bool {
        self.p.is_finite() && self.p > 0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    /// Bucket open time in seconds since epoch.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl Candle {
    pub fn flat(time: i64, price: f64) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Some(0.0),
        }
    }

    pub fn apply_price(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    pub fn is_valid(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|value| !value.is_finite() || *value <= 0.0) {
            return false;
        }
        self.low <= self.open.min(self.close) && self.open.max(self.close) <= self.high
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartKey {
    pub instrument: String,
    pub timeframe: Timeframe,
}

impl ChartKey {
    pub fn new(instrument: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            instrument: instrument.into(),
            timeframe,
        }
    }

    /// Stable key for seeding synthetic series, e.g. `EURUSD:5m`.
    pub fn seed_key(&self) -> String {
        format!("{}:{}", self.instrument, self.timeframe.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CandleSource {
    Cache,
    Ticks,
    Synthetic,
    Live,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
    Deduped,
    Unknown,
}

impl CacheStatus {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|raw| raw.trim().to_ascii_uppercase()).as_deref() {
            Some("HIT") => Self::Hit,
            Some("MISS") => Self::Miss,
            Some("STALE") => Self::Stale,
            Some("DEDUPED") => Self::Deduped,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketStreamStatusSnapshot {
    pub state: ConnectionState,
    pub instrument: String,
    pub timeframe: Timeframe,
    pub reconnect_attempt: u32,
    pub next_reconnect_ms: Option<u64>,
    pub last_tick_ms: Option<i64>,
    pub reason: Option<String>,
}

impl MarketStreamStatusSnapshot {
    pub fn disconnected(key: &ChartKey, reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            instrument: key.instrument.clone(),
            timeframe: key.timeframe,
            reconnect_attempt: 0,
            next_reconnect_ms: None,
            last_tick_ms: None,
            reason,
        }
    }
}

/// A complete series handed to the chart surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartFrame {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
    pub source: CandleSource,
    pub simulated: bool,
    pub stale: bool,
}

/// Conflated point update drained at the UI cadence.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartPointUpdate {
    pub price: Option<Tick>,
    pub candle: Option<Candle>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeKind {
    RateLimited { retry_after_ms: u64 },
    FetchFailed { code: String, message: String },
    NoData,
    Simulated,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartNotice {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub notice: NoticeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartChartSessionArgs {
    pub instrument: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub history_limit: Option<u16>,
    pub emit_interval_ms: Option<u64>,
    pub tick_capacity: Option<usize>,
    pub seed_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartSessionConfig {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub history_limit: u16,
    pub emit_interval_ms: u64,
    pub tick_capacity: usize,
    pub seed_price: f64,
}

impl ChartSessionConfig {
    pub fn key(&self) -> ChartKey {
        ChartKey::new(self.instrument.clone(), self.timeframe)
    }
}

impl Default for ChartSessionConfig {
    fn default() -> Self {
        Self {
            instrument: DEFAULT_INSTRUMENT.to_string(),
            timeframe: DEFAULT_TIMEFRAME,
            history_limit: DEFAULT_HISTORY_LIMIT,
            emit_interval_ms: DEFAULT_EMIT_INTERVAL_MS,
            tick_capacity: DEFAULT_TICK_CAPACITY,
            seed_price: DEFAULT_SEED_PRICE,
        }
    }
}

pub fn normalize_instrument(raw: &str) -> Result<String, AppError> {
    let instrument = raw.trim().to_ascii_uppercase();
    if instrument.is_empty()
        || !instrument
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '/')
    {
        return Err(AppError::InvalidArgument(
            "instrument must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(instrument)
}

impl StartChartSessionArgs {
    pub fn normalize(self) -> Result<ChartSessionConfig, AppError> {
        let instrument = normalize_instrument(self.instrument.as_deref().unwrap_or(DEFAULT_INSTRUMENT))?;
        let timeframe = self.timeframe.unwrap_or(DEFAULT_TIMEFRAME);

        let history_limit = self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&history_limit) {
            return Err(AppError::InvalidArgument(format!(
                "historyLimit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }

        let emit_interval_ms = self.emit_interval_ms.unwrap_or(DEFAULT_EMIT_INTERVAL_MS);
        if !(MIN_EMIT_INTERVAL_MS..=MAX_EMIT_INTERVAL_MS).contains(&emit_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "emitIntervalMs must be between {MIN_EMIT_INTERVAL_MS} and {MAX_EMIT_INTERVAL_MS}"
            )));
        }

        let tick_capacity = self.tick_capacity.unwrap_or(DEFAULT_TICK_CAPACITY);
        if !(MIN_TICK_CAPACITY..=MAX_TICK_CAPACITY).contains(&tick_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "tickCapacity must be between {MIN_TICK_CAPACITY} and {MAX_TICK_CAPACITY}"
            )));
        }

        let seed_price = self.seed_price.unwrap_or(DEFAULT_SEED_PRICE);
        if !seed_price.is_finite() || seed_price <= 0.0 {
            return Err(AppError::InvalidArgument(
                "seedPrice must be a finite positive number".to_string(),
            ));
        }

        Ok(ChartSessionConfig {
            instrument,
            timeframe,
            history_limit,
            emit_interval_ms,
            tick_capacity,
            seed_price,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SwitchChartArgs {
    pub instrument: Option<String>,
    pub timeframe: Option<Timeframe>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSessionInfo {
    pub running: bool,
    pub instrument: String,
    pub timeframe: Timeframe,
    pub history_limit: u16,
    pub emit_interval_ms: u64,
    pub live_socket: bool,
}

impl ChartSessionInfo {
    pub fn from_config(config: &ChartSessionConfig, live_socket: bool) -> Self {
        Self {
            running: true,
            instrument: config.instrument.clone(),
            timeframe: config.timeframe,
            history_limit: config.history_limit,
            emit_interval_ms: config.emit_interval_ms,
            live_socket,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSessionStopResult {
    pub stopped: bool,
}
