use crate::error::AppError;
use crate::market::candles::candle_bucket_open_time;
use crate::market::types::{CacheStatus, Candle, Timeframe};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CACHE_STATUS_HEADER: &str = "x-cache";
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const MIN_RATE_LIMIT_DELAY_SECS: f64 = 5.0;
const MAX_RATE_LIMIT_DELAY_SECS: f64 = 3_600.0;
const RATE_LIMIT_FLOOR: Duration = Duration::from_secs(1);
/// Numeric timestamps at or above this are milliseconds, below are seconds.
const MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct CandleFetchRequest {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub limit: u16,
    pub force_fresh: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandleFetchResult {
    pub candles: Vec<Candle>,
    pub cache_status: CacheStatus,
    pub stale: bool,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkPriceReport {
    pub asset: String,
    pub price: f64,
    pub idempotency_key: String,
}

#[async_trait]
pub trait CandleProvider: Send + Sync {
    async fn fetch_candles(
        &self,
        request: &CandleFetchRequest,
        cancel: &CancellationToken,
    ) -> Result<CandleFetchResult, AppError>;
}

#[async_trait]
pub trait MarkPriceSink: Send + Sync {
    async fn push_mark_price(&self, report: &MarkPriceReport, token: &str) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    market: String,
}

impl RestClient {
    pub fn new(client: Client, base_url: impl Into<String>, market: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            market: market.into(),
        }
    }
}

fn candles_endpoint(base_url: &str, market: &str, request: &CandleFetchRequest) -> String {
    let mut endpoint = format!("{base_url}/market/{market}/candles")
        + &format!(
            "?display={}&tf={}&limit={}",
            request.instrument,
            request.timeframe.as_str(),
            request.limit
        );
    if request.force_fresh {
        endpoint.push_str("&fresh=1");
    }
    endpoint
}

fn trades_endpoint(base_url: &str) -> String {
    format!("{base_url}/trades")
}

fn header_str(headers: &HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

#[async_trait]
impl CandleProvider for RestClient {
    async fn fetch_candles(
        &self,
        request: &CandleFetchRequest,
        cancel: &CancellationToken,
    ) -> Result<CandleFetchResult, AppError> {
        let endpoint = candles_endpoint(&self.base_url, &self.market, request);
        let exchange = async {
            let response = self.client.get(endpoint).send().await?;
            let status = response.status().as_u16();
            let retry_after = header_str(response.headers(), RETRY_AFTER);
            let cache_status = header_str(response.headers(), CACHE_STATUS_HEADER);
            let body = response.bytes().await?.to_vec();
            interpret_candle_response(
                status,
                retry_after.as_deref(),
                cache_status.as_deref(),
                body,
                request.timeframe,
            )
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            result = exchange => result,
        }
    }
}

#[derive(Debug, Serialize)]
struct MarkPriceWire<'a> {
    action: &'static str,
    asset: &'a str,
    price: f64,
}

#[async_trait]
impl MarkPriceSink for RestClient {
    async fn push_mark_price(&self, report: &MarkPriceReport, token: &str) -> Result<(), AppError> {
        let payload = MarkPriceWire {
            action: "mark_price",
            asset: &report.asset,
            price: report.price,
        };
        self.client
            .patch(trades_endpoint(&self.base_url))
            .bearer_auth(token)
            .header(IDEMPOTENCY_KEY_HEADER, report.idempotency_key.as_str())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandleResponseWire {
    #[serde(default, alias = "data", alias = "rows")]
    candles: Vec<CandleRowWire>,
    ok: Option<bool>,
    code: Option<String>,
    message: Option<String>,
    error: Option<String>,
    retry_after_sec: Option<f64>,
    stale: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CandleRowWire {
    Object(CandleObjectWire),
    Array(Vec<Option<ScalarWire>>),
    Other(IgnoredAny),
}

#[derive(Debug, Deserialize)]
struct CandleObjectWire {
    #[serde(
        default,
        alias = "t",
        alias = "timestamp",
        alias = "ts",
        alias = "openTime",
        alias = "open_time",
        alias = "date",
        alias = "datetime"
    )]
    time: Option<ScalarWire>,
    #[serde(default, alias = "o")]
    open: Option<ScalarWire>,
    #[serde(default, alias = "h")]
    high: Option<ScalarWire>,
    #[serde(default, alias = "l")]
    low: Option<ScalarWire>,
    #[serde(default, alias = "c")]
    close: Option<ScalarWire>,
    #[serde(default, alias = "v", alias = "vol")]
    volume: Option<ScalarWire>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ScalarWire {
    Number(f64),
    Text(String),
}

fn scalar_to_f64(value: &ScalarWire) -> Option<f64> {
    let parsed = match value {
        ScalarWire::Number(number) => *number,
        ScalarWire::Text(text) => text.trim().parse::<f64>().ok()?,
    };
    parsed.is_finite().then_some(parsed)
}

/// Epoch seconds or milliseconds to milliseconds.
pub(crate) fn epoch_to_ms(number: f64) -> i64 {
    let millis = if number.abs() >= MILLIS_THRESHOLD {
        number
    } else {
        number * 1_000.0
    };
    millis.round() as i64
}

fn parse_time_ms(value: &ScalarWire) -> Result<i64, AppError> {
    if let Some(number) = scalar_to_f64(value) {
        return Ok(epoch_to_ms(number));
    }

    match value {
        ScalarWire::Text(text) => chrono::DateTime::parse_from_rfc3339(text.trim())
            .map(|parsed| parsed.timestamp_millis())
            .map_err(|error| AppError::Parse(format!("unparseable candle time '{text}': {error}"))),
        ScalarWire::Number(number) => Err(AppError::Parse(format!(
            "non-finite candle time {number}"
        ))),
    }
}

fn required_price(value: Option<&ScalarWire>, field: &str) -> Result<f64, AppError> {
    value
        .and_then(scalar_to_f64)
        .ok_or_else(|| AppError::Parse(format!("candle row missing numeric {field}")))
}

fn normalize_row(row: &CandleRowWire, bucket_ms: i64) -> Result<Candle, AppError> {
    let fields: [Option<&ScalarWire>; 6] = match row {
        CandleRowWire::Object(object) => [
            object.time.as_ref(),
            object.open.as_ref(),
            object.high.as_ref(),
            object.low.as_ref(),
            object.close.as_ref(),
            object.volume.as_ref(),
        ],
        CandleRowWire::Array(values) => {
            let at = |index: usize| values.get(index).and_then(Option::as_ref);
            [at(0), at(1), at(2), at(3), at(4), at(5)]
        }
        CandleRowWire::Other(_) => {
            return Err(AppError::Parse(
                "candle row is neither an object nor an array".to_string(),
            ))
        }
    };

    let time_ms = match fields[0] {
        Some(value) => parse_time_ms(value)?,
        None => return Err(AppError::Parse("candle row missing time".to_string())),
    };
    let candle = Candle {
        time: candle_bucket_open_time(time_ms, bucket_ms).div_euclid(1_000),
        open: required_price(fields[1], "open")?,
        high: required_price(fields[2], "high")?,
        low: required_price(fields[3], "low")?,
        close: required_price(fields[4], "close")?,
        volume: fields[5]
            .and_then(scalar_to_f64)
            .filter(|volume| *volume >= 0.0),
    };

    if !candle.is_valid() {
        return Err(AppError::Parse(format!(
            "candle row at {} violates OHLC ordering or positivity",
            candle.time
        )));
    }
    Ok(candle)
}

/// Normalizes rows into an ascending, de-duplicated series. Returns the number of dropped rows.
fn normalize_rows(rows: &[CandleRowWire], timeframe: Timeframe) -> (Vec<Candle>, usize) {
    let bucket_ms = timeframe.bucket_ms();
    let mut by_time = BTreeMap::new();
    let mut dropped = 0;
    for row in rows {
        match normalize_row(row, bucket_ms) {
            Ok(candle) => {
                by_time.insert(candle.time, candle);
            }
            Err(error) => {
                dropped += 1;
                tracing::trace!(%error, "dropping candle row");
            }
        }
    }
    (by_time.into_values().collect(), dropped)
}

/// `max(header, body, 5s)` with a 1s floor.
pub fn rate_limit_delay(header_secs: Option<f64>, body_secs: Option<f64>) -> Duration {
    let secs = [header_secs, body_secs]
        .into_iter()
        .flatten()
        .filter(|value| value.is_finite() && *value >= 0.0)
        .fold(MIN_RATE_LIMIT_DELAY_SECS, f64::max)
        .min(MAX_RATE_LIMIT_DELAY_SECS);
    Duration::from_secs_f64(secs).max(RATE_LIMIT_FLOOR)
}

fn decode_response_body(body: &mut [u8]) -> Option<CandleResponseWire> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    simd_json::serde::from_slice::<CandleResponseWire>(body).ok()
}

fn interpret_candle_response(
    status: u16,
    retry_after: Option<&str>,
    cache_status: Option<&str>,
    mut body: Vec<u8>,
    timeframe: Timeframe,
) -> Result<CandleFetchResult, AppError> {
    let wire = decode_response_body(&mut body);

    if status == 429 {
        let header_secs = retry_after.and_then(|value| value.parse::<f64>().ok());
        let body_secs = wire.as_ref().and_then(|payload| payload.retry_after_sec);
        return Err(AppError::RateLimited {
            retry_after: rate_limit_delay(header_secs, body_secs),
        });
    }

    if !(200..300).contains(&status) {
        let (code, message) = match wire {
            Some(payload) => (payload.code, payload.message.or(payload.error)),
            None => (None, None),
        };
        return Err(AppError::FetchFailed {
            status: Some(status),
            code: code.unwrap_or_else(|| format!("http_{status}")),
            message: message
                .unwrap_or_else(|| format!("candle request failed with status {status}")),
        });
    }

    let Some(payload) = wire else {
        return Err(AppError::FetchFailed {
            status: Some(status),
            code: "invalid_body".to_string(),
            message: "candle response body is not a JSON object".to_string(),
        });
    };

    if payload.ok == Some(false) {
        return Err(AppError::FetchFailed {
            status: Some(status),
            code: payload.code.unwrap_or_else(|| "not_ok".to_string()),
            message: payload
                .message
                .or(payload.error)
                .unwrap_or_else(|| "candle endpoint reported failure".to_string()),
        });
    }

    let cache_status = CacheStatus::from_header(cache_status);
    let (candles, dropped_rows) = normalize_rows(&payload.candles, timeframe);
    Ok(CandleFetchResult {
        candles,
        cache_status,
        stale: cache_status == CacheStatus::Stale || payload.stale.unwrap_or(false),
        dropped_rows,
    })
}
