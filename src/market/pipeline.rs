use crate::error::AppError;
use crate::market::auth::TokenCache;
use crate::market::cache::{CacheEntry, CandleCache};
use crate::market::candles::{apply_live_tick, build_candles, LiveUpdate};
use crate::market::clock::Clock;
use crate::market::persistence::{
    load_cache_entries, load_session_ticks, prune_session_cache, save_cache_entry,
    save_session_ticks,
};
use crate::market::rest::{
    CandleFetchRequest, CandleFetchResult, CandleProvider, MarkPriceReport, MarkPriceSink,
};
use crate::market::synthetic::synthetic_candles;
use crate::market::throttle::{OpenPositions, PricePushThrottler, PushDecision};
use crate::market::ticks::TickStore;
use crate::market::transport::{spawn_live_socket, LiveSocketConfig, SocketCommand, SocketEvent};
use crate::market::types::{
    Candle, CandleSource, ChartFrame, ChartKey, ChartNotice, ChartPointUpdate, ChartSessionConfig,
    ConnectionState, MarketStreamStatusSnapshot, NoticeKind, Tick, Timeframe,
};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Serialize, Serializer};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CHART_FRAME_EVENT, CHART_NOTICE_EVENT, CHART_POINT_EVENT, CHART_STATUS_EVENT};

pub const HIDDEN_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const POLL_JITTER_RATIO: f64 = 0.1;
const STATUS_ERROR_THROTTLE_MS: u64 = 500;

/// Receives everything the engine wants drawn. Implementations must not call
/// back into the engine.
pub trait ChartSurface: Send + Sync {
    fn set_candles(&self, frame: &ChartFrame);
    fn update_point(&self, update: &ChartPointUpdate);
    fn set_status(&self, status: &MarketStreamStatusSnapshot);
    fn notice(&self, notice: &ChartNotice);
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ChartEvent {
    Frame(ChartFrame),
    Point(ChartPointUpdate),
    Status(MarketStreamStatusSnapshot),
    Notice(ChartNotice),
}

impl ChartEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Frame(_) => CHART_FRAME_EVENT,
            Self::Point(_) => CHART_POINT_EVENT,
            Self::Status(_) => CHART_STATUS_EVENT,
            Self::Notice(_) => CHART_NOTICE_EVENT,
        }
    }
}

/// Fans chart output out to any number of host listeners.
#[derive(Debug, Clone)]
pub struct BroadcastSurface {
    sender: broadcast::Sender<ChartEvent>,
}

impl BroadcastSurface {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChartEvent> {
        self.sender.subscribe()
    }

    fn emit(&self, event: ChartEvent) {
        // No listeners is not an error.
        let _ = self.sender.send(event);
    }
}

impl ChartSurface for BroadcastSurface {
    fn set_candles(&self, frame: &ChartFrame) {
        self.emit(ChartEvent::Frame(frame.clone()));
    }

    fn update_point(&self, update: &ChartPointUpdate) {
        self.emit(ChartEvent::Point(update.clone()));
    }

    fn set_status(&self, status: &MarketStreamStatusSnapshot) {
        self.emit(ChartEvent::Status(status.clone()));
    }

    fn notice(&self, notice: &ChartNotice) {
        self.emit(ChartEvent::Notice(notice.clone()));
    }
}

/// Last-value-wins buffer between the tick path and the UI cadence.
#[derive(Debug, Default)]
pub struct ConflatedChartState {
    pending_price: Option<Tick>,
    pending_candle: Option<Candle>,
}

pub fn drain_chart_point(state: &mut ConflatedChartState) -> Option<ChartPointUpdate> {
    let price = state.pending_price.take();
    let candle = state.pending_candle.take();
    if price.is_none() && candle.is_none() {
        return None;
    }
    Some(ChartPointUpdate { price, candle })
}

fn serialize_duration_ms<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Updated {
        candles: usize,
    },
    SkippedFresh,
    SkippedInFlight,
    /// The server's retry-after has not elapsed yet; nothing was sent.
    SkippedRateLimited {
        #[serde(rename = "retryAfterMs", serialize_with = "serialize_duration_ms")]
        retry_after: Duration,
    },
    NoData,
    /// The response arrived after the chart moved to another key.
    Discarded,
    Cancelled,
    RateLimited {
        #[serde(rename = "retryAfterMs", serialize_with = "serialize_duration_ms")]
        retry_after: Duration,
    },
    Failed {
        code: String,
    },
}

/// Next poll delay: the rate-limit override wins, hidden screens slow down,
/// otherwise the timeframe's base interval with bounded jitter.
pub fn poll_delay(
    timeframe: Timeframe,
    visible: bool,
    rate_limited: Option<Duration>,
    jitter_ratio: f64,
) -> Duration {
    if let Some(retry_after) = rate_limited {
        return if visible {
            retry_after
        } else {
            retry_after.max(HIDDEN_POLL_INTERVAL)
        };
    }
    if !visible {
        return HIDDEN_POLL_INTERVAL;
    }

    let ratio = jitter_ratio.clamp(-POLL_JITTER_RATIO, POLL_JITTER_RATIO);
    let base_ms = timeframe.base_poll_interval_ms() as f64;
    Duration::from_millis((base_ms * (1.0 + ratio)).round() as u64)
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<ConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

fn allow_status_publish(
    throttle: &Mutex<StatusPublishThrottle>,
    state: ConnectionState,
    reason: &Option<String>,
) -> bool {
    let mut writable = throttle.lock();
    let now = Instant::now();
    let should_throttle = matches!(state, ConnectionState::Error | ConnectionState::Connecting);

    if should_throttle
        && writable.last_state == Some(state)
        && writable.last_reason == *reason
        && writable
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    writable.last_state = Some(state);
    writable.last_reason = reason.clone();
    writable.last_emit = Some(now);
    true
}

pub struct ChartEngineDeps {
    pub provider: Arc<dyn CandleProvider>,
    pub mark_sink: Option<Arc<dyn MarkPriceSink>>,
    pub tokens: Option<Arc<TokenCache>>,
    pub positions: Arc<dyn OpenPositions>,
    pub clock: Arc<dyn Clock>,
    pub surface: Arc<dyn ChartSurface>,
    pub session_cache: Option<SqlitePool>,
}

#[derive(Debug)]
struct ChartView {
    key: ChartKey,
    generation: u64,
    series: Vec<Candle>,
    source: CandleSource,
}

#[derive(Debug)]
struct InFlightFetch {
    id: u64,
    cancel: CancellationToken,
}

/// Frees the in-flight slot when the owning refresh future goes away, even if
/// it is dropped before the response arrives.
struct InFlightGuard<'a> {
    inner: &'a Mutex<EngineInner>,
    id: u64,
    cancel: CancellationToken,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.in_flight.as_ref().map(|fetch| fetch.id) == Some(self.id) {
            inner.in_flight = None;
        }
        self.cancel.cancel();
    }
}

fn rate_limit_remaining(until_ms: Option<i64>, now_ms: i64) -> Option<Duration> {
    let remaining_ms = until_ms?.saturating_sub(now_ms);
    (remaining_ms > 0).then(|| Duration::from_millis(remaining_ms as u64))
}

struct EngineInner {
    config: ChartSessionConfig,
    view: ChartView,
    ticks: TickStore,
    cache: CandleCache,
    throttler: PricePushThrottler,
    conflated: ConflatedChartState,
    in_flight: Option<InFlightFetch>,
    fetch_seq: u64,
    rate_limited_until_ms: Option<i64>,
    visible: bool,
    last_tick_ms: Option<i64>,
}

/// One chart session: paints, polls, follows live ticks and reports marks.
pub struct ChartEngine {
    deps: ChartEngineDeps,
    inner: Mutex<EngineInner>,
    status: Arc<RwLock<MarketStreamStatusSnapshot>>,
    status_throttle: Mutex<StatusPublishThrottle>,
    socket_commands: Mutex<Option<mpsc::UnboundedSender<SocketCommand>>>,
    poll_wake: Notify,
    cancel: CancellationToken,
}

impl ChartEngine {
    pub fn new(
        config: ChartSessionConfig,
        deps: ChartEngineDeps,
        status: Arc<RwLock<MarketStreamStatusSnapshot>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let inner = EngineInner {
            view: ChartView {
                key: config.key(),
                generation: 0,
                series: Vec::new(),
                source: CandleSource::Synthetic,
            },
            ticks: TickStore::new(config.tick_capacity),
            cache: CandleCache::new(),
            throttler: PricePushThrottler::default(),
            conflated: ConflatedChartState::default(),
            in_flight: None,
            fetch_seq: 0,
            rate_limited_until_ms: None,
            visible: true,
            last_tick_ms: None,
            config,
        };

        Arc::new(Self {
            deps,
            inner: Mutex::new(inner),
            status,
            status_throttle: Mutex::new(StatusPublishThrottle::default()),
            socket_commands: Mutex::new(None),
            poll_wake: Notify::new(),
            cancel,
        })
    }

    pub fn key(&self) -> ChartKey {
        self.inner.lock().view.key.clone()
    }

    pub fn config(&self) -> ChartSessionConfig {
        self.inner.lock().config.clone()
    }

    pub fn series(&self) -> Vec<Candle> {
        self.inner.lock().view.series.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn notify(&self, key: &ChartKey, notice: NoticeKind) {
        self.deps.surface.notice(&ChartNotice {
            instrument: key.instrument.clone(),
            timeframe: key.timeframe,
            notice,
        });
    }

    /// Paints the best locally available series: cache, then ticks, then synthetic.
    fn paint_local(&self, inner: &mut EngineInner, now_ms: i64) -> CandleSource {
        let key = inner.view.key.clone();
        let bucket_ms = key.timeframe.bucket_ms();
        let count = usize::from(inner.config.history_limit);

        let cached = inner
            .cache
            .get(&key)
            .filter(|entry| !entry.candles.is_empty())
            .map(|entry| (entry.candles.clone(), !entry.is_fresh(key.timeframe, now_ms)));

        let (candles, source, stale) = match cached {
            Some((candles, stale)) => (candles, CandleSource::Cache, stale),
            None => {
                let ticks = inner.ticks.ticks(&key.instrument);
                let built = build_candles(&ticks, bucket_ms, count, now_ms + bucket_ms);
                if built.is_empty() {
                    let seed_price = inner
                        .ticks
                        .last(&key.instrument)
                        .map(|tick| tick.p)
                        .unwrap_or(inner.config.seed_price);
                    let synthetic =
                        synthetic_candles(seed_price, bucket_ms, count, &key.seed_key(), now_ms);
                    (synthetic, CandleSource::Synthetic, false)
                } else {
                    (built, CandleSource::Ticks, false)
                }
            }
        };

        let simulated = source == CandleSource::Synthetic;
        self.deps.surface.set_candles(&ChartFrame {
            instrument: key.instrument.clone(),
            timeframe: key.timeframe,
            candles: candles.clone(),
            source,
            simulated,
            stale,
        });
        if simulated {
            warn!(
                instrument = %key.instrument,
                timeframe = key.timeframe.as_str(),
                "no candle data available, painting simulated series"
            );
            self.notify(&key, NoticeKind::Simulated);
        }

        inner.view.series = candles;
        inner.view.source = source;
        inner.conflated.pending_candle = None;
        source
    }

    /// Immediate local paint of the current key.
    pub fn paint_now(&self) -> CandleSource {
        let now_ms = self.deps.clock.now_ms();
        let mut inner = self.inner.lock();
        self.paint_local(&mut inner, now_ms)
    }

    /// Fetches the current key unless the cache is fresh, the server asked us to
    /// back off, or a fetch is already out. A forced refresh supersedes and
    /// cancels the outstanding fetch.
    pub async fn refresh(&self, force: bool) -> RefreshOutcome {
        let now_ms = self.deps.clock.now_ms();
        let (request, generation, guard) = {
            let mut inner = self.inner.lock();
            if let Some(retry_after) = rate_limit_remaining(inner.rate_limited_until_ms, now_ms) {
                return RefreshOutcome::SkippedRateLimited { retry_after };
            }
            if inner.in_flight.is_some() && !force {
                return RefreshOutcome::SkippedInFlight;
            }
            let key = inner.view.key.clone();
            if inner.cache.should_skip_fetch(&key, now_ms, force) {
                return RefreshOutcome::SkippedFresh;
            }
            if let Some(previous) = inner.in_flight.take() {
                debug!(instrument = %key.instrument, "forced refresh supersedes outstanding fetch");
                previous.cancel.cancel();
            }

            inner.fetch_seq = inner.fetch_seq.wrapping_add(1);
            let id = inner.fetch_seq;
            let cancel = self.cancel.child_token();
            inner.in_flight = Some(InFlightFetch {
                id,
                cancel: cancel.clone(),
            });
            let request = CandleFetchRequest {
                instrument: key.instrument,
                timeframe: key.timeframe,
                limit: inner.config.history_limit,
                force_fresh: force,
            };
            let guard = InFlightGuard {
                inner: &self.inner,
                id,
                cancel,
            };
            (request, inner.view.generation, guard)
        };

        let result = self
            .deps
            .provider
            .fetch_candles(&request, &guard.cancel)
            .await;
        self.apply_fetch_result(&request, generation, guard.id, result)
    }

    fn apply_fetch_result(
        &self,
        request: &CandleFetchRequest,
        generation: u64,
        fetch_id: u64,
        result: Result<CandleFetchResult, AppError>,
    ) -> RefreshOutcome {
        let now_ms = self.deps.clock.now_ms();
        let mut mark_price = None;

        let outcome = {
            let mut inner = self.inner.lock();
            let current = inner.in_flight.as_ref().map(|fetch| fetch.id) == Some(fetch_id);
            if current {
                inner.in_flight = None;
            }
            if !current || inner.view.generation != generation {
                debug!(
                    instrument = %request.instrument,
                    timeframe = request.timeframe.as_str(),
                    "discarding candle response for a superseded request"
                );
                return RefreshOutcome::Discarded;
            }

            let key = inner.view.key.clone();
            match result {
                Ok(fetched) if fetched.candles.is_empty() => {
                    debug!(instrument = %key.instrument, "candle fetch returned no rows");
                    self.notify(&key, NoticeKind::NoData);
                    RefreshOutcome::NoData
                }
                Ok(fetched) => {
                    let count = fetched.candles.len();
                    inner.cache.put(
                        key.clone(),
                        CacheEntry {
                            fetched_at: now_ms,
                            candles: fetched.candles.clone(),
                            source: CandleSource::Live,
                        },
                    );
                    self.deps.surface.set_candles(&ChartFrame {
                        instrument: key.instrument.clone(),
                        timeframe: key.timeframe,
                        candles: fetched.candles.clone(),
                        source: CandleSource::Live,
                        simulated: false,
                        stale: fetched.stale,
                    });

                    if let Some(last) = fetched.candles.last() {
                        let positions = self.deps.positions.open_position_count(&key.instrument);
                        let decision =
                            inner
                                .throttler
                                .evaluate(&key.instrument, last.close, positions, now_ms);
                        if decision == PushDecision::Push {
                            mark_price = Some((key.instrument.clone(), last.close));
                        }
                    }

                    inner.rate_limited_until_ms = None;
                    inner.view.series = fetched.candles;
                    inner.view.source = CandleSource::Live;
                    inner.conflated.pending_candle = None;
                    RefreshOutcome::Updated { candles: count }
                }
                Err(AppError::Cancelled) => RefreshOutcome::Cancelled,
                Err(error) => {
                    if let Some(retry_after) = error.retry_after() {
                        warn!(
                            instrument = %key.instrument,
                            retry_after_ms = retry_after.as_millis() as u64,
                            "candle fetch rate limited"
                        );
                        let retry_after_ms =
                            i64::try_from(retry_after.as_millis()).unwrap_or(i64::MAX);
                        inner.rate_limited_until_ms = Some(now_ms.saturating_add(retry_after_ms));
                        self.notify(
                            &key,
                            NoticeKind::RateLimited {
                                retry_after_ms: retry_after.as_millis() as u64,
                            },
                        );
                        RefreshOutcome::RateLimited { retry_after }
                    } else {
                        warn!(
                            instrument = %key.instrument,
                            timeframe = key.timeframe.as_str(),
                            error = %error,
                            "candle fetch failed, keeping current series"
                        );
                        let code = error.code().to_string();
                        self.notify(
                            &key,
                            NoticeKind::FetchFailed {
                                code: code.clone(),
                                message: error.to_string(),
                            },
                        );
                        RefreshOutcome::Failed { code }
                    }
                }
            }
        };

        if let Some((instrument, price)) = mark_price {
            self.spawn_mark_price_push(instrument, price, now_ms);
        }
        outcome
    }

    /// Switches the chart; an outstanding fetch for the old key is cancelled and
    /// its late response discarded.
    pub async fn select(&self, instrument: &str, timeframe: Timeframe) -> bool {
        let now_ms = self.deps.clock.now_ms();
        let next = ChartKey::new(instrument, timeframe);
        let instrument_changed = {
            let mut inner = self.inner.lock();
            if inner.view.key == next {
                return false;
            }
            if let Some(fetch) = inner.in_flight.take() {
                fetch.cancel.cancel();
            }

            let instrument_changed = inner.view.key.instrument != next.instrument;
            inner.view.generation = inner.view.generation.wrapping_add(1);
            inner.view.key = next.clone();
            inner.view.series.clear();
            inner.config.instrument = next.instrument.clone();
            inner.config.timeframe = next.timeframe;
            inner.rate_limited_until_ms = None;
            inner.conflated = ConflatedChartState::default();
            if instrument_changed {
                inner.last_tick_ms = None;
            }
            self.paint_local(&mut inner, now_ms);
            instrument_changed
        };

        if instrument_changed {
            if let Some(commands) = self.socket_commands.lock().as_ref() {
                let _ = commands.send(SocketCommand::Watch(Some(next.instrument.clone())));
            }
        }
        info!(
            instrument = %next.instrument,
            timeframe = next.timeframe.as_str(),
            "chart switched"
        );

        let (state, reconnect_attempt) = {
            let readable = self.status.read().await;
            (readable.state, readable.reconnect_attempt)
        };
        self.publish_status(state, reconnect_attempt, None, Some("chart switched".to_string()))
            .await;
        self.poll_wake.notify_one();
        true
    }

    /// Folds an accepted live tick into the store, the chart tail and the throttler.
    pub fn on_tick(&self, instrument: &str, tick: Tick) -> Option<PushDecision> {
        if !tick.is_valid() {
            return None;
        }
        let now_ms = self.deps.clock.now_ms();

        let decision = {
            let mut inner = self.inner.lock();
            inner.ticks.push(instrument, tick);

            if inner.view.key.instrument == instrument {
                inner.last_tick_ms = Some(tick.t);
                inner.conflated.pending_price = Some(tick);
                if inner.view.source == CandleSource::Synthetic {
                    self.paint_local(&mut inner, now_ms);
                } else {
                    let bucket_ms = inner.view.key.timeframe.bucket_ms();
                    match apply_live_tick(&mut inner.view.series, tick.p, tick.t, bucket_ms) {
                        LiveUpdate::Mutated(candle) | LiveUpdate::Opened(candle) => {
                            inner.conflated.pending_candle = Some(candle);
                        }
                        LiveUpdate::NoBase | LiveUpdate::Ignored => {}
                    }
                }
            }

            let positions = self.deps.positions.open_position_count(instrument);
            inner.throttler.evaluate(instrument, tick.p, positions, now_ms)
        };

        if decision == PushDecision::Push {
            self.spawn_mark_price_push(instrument.to_string(), tick.p, now_ms);
        }
        Some(decision)
    }

    fn spawn_mark_price_push(&self, instrument: String, price: f64, now_ms: i64) {
        let (Some(sink), Some(tokens)) = (self.deps.mark_sink.clone(), self.deps.tokens.clone())
        else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(%instrument, "no runtime for mark price push");
            return;
        };

        let cancel = self.cancel.clone();
        let report = MarkPriceReport {
            idempotency_key: format!("{instrument}:{price:.5}:{now_ms}"),
            asset: instrument,
            price,
        };
        runtime.spawn(async move {
            let push = async {
                let token = tokens.require_token().await?;
                sink.push_mark_price(&report, &token).await
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = push => {
                    if let Err(error) = result {
                        debug!(asset = %report.asset, error = %error, "mark price push dropped");
                    }
                }
            }
        });
    }

    pub fn drain_frame(&self) -> Option<ChartPointUpdate> {
        drain_chart_point(&mut self.inner.lock().conflated)
    }

    pub fn set_visible(&self, visible: bool) {
        let became_visible = {
            let mut inner = self.inner.lock();
            let became_visible = visible && !inner.visible;
            inner.visible = visible;
            became_visible
        };
        if became_visible {
            self.poll_wake.notify_one();
        }
    }

    pub fn is_visible(&self) -> bool {
        self.inner.lock().visible
    }

    /// Waits out any pending rate-limit deadline.
    pub fn next_poll_delay(&self) -> Duration {
        let jitter_ratio = rand::thread_rng().gen_range(-POLL_JITTER_RATIO..=POLL_JITTER_RATIO);
        let now_ms = self.deps.clock.now_ms();
        let inner = self.inner.lock();
        let rate_limited = rate_limit_remaining(inner.rate_limited_until_ms, now_ms);
        poll_delay(inner.view.key.timeframe, inner.visible, rate_limited, jitter_ratio)
    }

    async fn publish_status(
        &self,
        state: ConnectionState,
        reconnect_attempt: u32,
        next_reconnect_ms: Option<u64>,
        reason: Option<String>,
    ) {
        if !allow_status_publish(&self.status_throttle, state, &reason) {
            return;
        }

        let snapshot = {
            let inner = self.inner.lock();
            MarketStreamStatusSnapshot {
                state,
                instrument: inner.view.key.instrument.clone(),
                timeframe: inner.view.key.timeframe,
                reconnect_attempt,
                next_reconnect_ms,
                last_tick_ms: inner.last_tick_ms,
                reason,
            }
        };

        {
            let mut writable = self.status.write().await;
            *writable = snapshot.clone();
        }
        self.deps.surface.set_status(&snapshot);
    }

    /// Seeds the tick store and cache from the previous session, if any.
    pub async fn restore_session(&self) {
        let Some(pool) = &self.deps.session_cache else {
            return;
        };
        let now_ms = self.deps.clock.now_ms();
        let instrument = self.key().instrument;

        match prune_session_cache(pool, now_ms).await {
            Ok(pruned) if pruned > 0 => debug!(pruned, "pruned expired session cache rows"),
            Ok(_) => {}
            Err(error) => debug!(error = %error, "session cache prune failed"),
        }

        let ticks = match load_session_ticks(pool, &instrument, now_ms).await {
            Ok(ticks) => ticks,
            Err(error) => {
                debug!(%instrument, error = %error, "session ticks unavailable");
                Vec::new()
            }
        };
        let entries = match load_cache_entries(pool, &instrument, now_ms).await {
            Ok(entries) => entries,
            Err(error) => {
                debug!(%instrument, error = %error, "session candles unavailable");
                Vec::new()
            }
        };

        let mut inner = self.inner.lock();
        if !ticks.is_empty() {
            inner.ticks.restore(&instrument, ticks);
        }
        for (key, mut entry) in entries {
            // A previous session's fetch is shown but never counts as fresh.
            if entry.source == CandleSource::Live {
                entry.source = CandleSource::Cache;
            }
            if inner.cache.get(&key).is_none() {
                inner.cache.put(key, entry);
            }
        }
    }

    async fn persist_session(&self) {
        let Some(pool) = &self.deps.session_cache else {
            return;
        };
        let now_ms = self.deps.clock.now_ms();

        let (ticks, mut entries) = {
            let inner = self.inner.lock();
            let ticks = inner
                .ticks
                .instruments()
                .map(|instrument| (instrument.to_string(), inner.ticks.ticks(instrument)))
                .collect::<Vec<_>>();
            let entries = inner
                .cache
                .entries()
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect::<Vec<_>>();
            let built_locally = (inner.view.source == CandleSource::Ticks
                && inner.cache.get(&inner.view.key).is_none()
                && !inner.view.series.is_empty())
            .then(|| {
                (
                    inner.view.key.clone(),
                    CacheEntry {
                        fetched_at: now_ms,
                        candles: inner.view.series.clone(),
                        source: CandleSource::Ticks,
                    },
                )
            });
            (ticks, entries.into_iter().chain(built_locally).collect::<Vec<_>>())
        };
        entries.sort_by(|left, right| left.0.seed_key().cmp(&right.0.seed_key()));

        for (instrument, ticks) in ticks {
            if let Err(error) = save_session_ticks(pool, &instrument, &ticks, now_ms).await {
                debug!(%instrument, error = %error, "failed to persist session ticks");
            }
        }
        for (key, entry) in entries {
            if let Err(error) = save_cache_entry(pool, &key, &entry, now_ms).await {
                debug!(instrument = %key.instrument, error = %error, "failed to persist session candles");
            }
        }
    }

    /// Cancels all work, persists the session cache and clears in-memory stores.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        self.persist_session().await;

        {
            let mut inner = self.inner.lock();
            if let Some(fetch) = inner.in_flight.take() {
                fetch.cancel.cancel();
            }
            inner.ticks.clear();
            inner.cache.clear();
            inner.throttler.clear();
            inner.conflated = ConflatedChartState::default();
            inner.view.series.clear();
            inner.rate_limited_until_ms = None;
        }
        *self.socket_commands.lock() = None;

        self.publish_status(
            ConnectionState::Disconnected,
            0,
            None,
            Some("chart session stopped".to_string()),
        )
        .await;
    }

    async fn handle_socket_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::State {
                state,
                reconnect_attempt,
                next_reconnect_ms,
                reason,
            } => {
                self.publish_status(state, reconnect_attempt, next_reconnect_ms, reason)
                    .await;
            }
            SocketEvent::Tick { instrument, tick } => {
                self.on_tick(&instrument, tick);
            }
            SocketEvent::Hello => debug!("live socket hello"),
        }
    }

    async fn run_socket_consumer(&self, config: LiveSocketConfig) {
        let instrument = self.key().instrument;
        let mut handle = spawn_live_socket(config, Some(instrument), self.cancel.child_token());
        *self.socket_commands.lock() = Some(handle.commands.clone());

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = handle.events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.handle_socket_event(event).await;
        }

        *self.socket_commands.lock() = None;
        // The runner exits on the cancelled child token and then drops its sender.
        while handle.events.recv().await.is_some() {}
        let _ = handle.join_handle.await;
    }

    async fn run_frame_emitter(self: Arc<Self>) {
        let emit_interval_ms = self.inner.lock().config.emit_interval_ms;
        let mut ticker = tokio::time::interval(Duration::from_millis(emit_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(update) = self.drain_frame() {
                        self.deps.surface.update_point(&update);
                    }
                }
            }
        }
    }

    async fn run_poll_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            let outcome = self.refresh(false).await;
            debug!(?outcome, "chart poll");

            let delay = self.next_poll_delay();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.poll_wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Drives the session until its cancellation token fires, then tears down.
    pub async fn run(self: Arc<Self>, live_socket: Option<LiveSocketConfig>) {
        self.restore_session().await;
        self.paint_now();

        let emitter = tokio::spawn(Arc::clone(&self).run_frame_emitter());
        let poller = tokio::spawn(Arc::clone(&self).run_poll_loop());

        match live_socket {
            Some(config) => self.run_socket_consumer(config).await,
            None => {
                self.publish_status(
                    ConnectionState::Disconnected,
                    0,
                    None,
                    Some("live socket not configured, polling only".to_string()),
                )
                .await;
                self.cancel.cancelled().await;
            }
        }

        self.cancel.cancel();
        let _ = emitter.await;
        let _ = poller.await;
        self.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::initialize_in_memory_pool;
    use crate::market::auth::TokenSource;
    use crate::market::clock::ManualClock;
    use crate::market::throttle::PositionBook;
    use crate::market::types::CacheStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    const NOW_MS: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct RecordingSurface {
        events: Mutex<Vec<ChartEvent>>,
    }

    impl RecordingSurface {
        fn frames(&self) -> Vec<ChartFrame> {
            self.events
                .lock()
                .iter()
                .filter_map(|event| match event {
                    ChartEvent::Frame(frame) => Some(frame.clone()),
                    _ => None,
                })
                .collect()
        }

        fn notices(&self) -> Vec<NoticeKind> {
            self.events
                .lock()
                .iter()
                .filter_map(|event| match event {
                    ChartEvent::Notice(notice) => Some(notice.notice.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl ChartSurface for RecordingSurface {
        fn set_candles(&self, frame: &ChartFrame) {
            self.events.lock().push(ChartEvent::Frame(frame.clone()));
        }

        fn update_point(&self, update: &ChartPointUpdate) {
            self.events.lock().push(ChartEvent::Point(update.clone()));
        }

        fn set_status(&self, status: &MarketStreamStatusSnapshot) {
            self.events.lock().push(ChartEvent::Status(status.clone()));
        }

        fn notice(&self, notice: &ChartNotice) {
            self.events.lock().push(ChartEvent::Notice(notice.clone()));
        }
    }

    #[derive(Default)]
    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<CandleFetchResult, AppError>>>,
        requests: Mutex<Vec<CandleFetchRequest>>,
        entered: Notify,
        gate: Option<Notify>,
    }

    impl ScriptedProvider {
        fn with(responses: Vec<Result<CandleFetchResult, AppError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn gated(responses: Vec<Result<CandleFetchResult, AppError>>) -> Self {
            Self {
                gate: Some(Notify::new()),
                ..Self::with(responses)
            }
        }
    }

    #[async_trait]
    impl CandleProvider for ScriptedProvider {
        async fn fetch_candles(
            &self,
            request: &CandleFetchRequest,
            cancel: &CancellationToken,
        ) -> Result<CandleFetchResult, AppError> {
            self.requests.lock().push(request.clone());
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    _ = gate.notified() => {}
                }
            }
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(fetched(Vec::new())))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<(MarkPriceReport, String)>>,
        pushed: Notify,
    }

    #[async_trait]
    impl MarkPriceSink for RecordingSink {
        async fn push_mark_price(
            &self,
            report: &MarkPriceReport,
            token: &str,
        ) -> Result<(), AppError> {
            self.reports.lock().push((report.clone(), token.to_string()));
            self.pushed.notify_one();
            Ok(())
        }
    }

    struct FixedToken;

    #[async_trait]
    impl TokenSource for FixedToken {
        async fn current_session(&self) -> Option<String> {
            Some("session-token".to_string())
        }

        async fn refresh_session(&self) -> Option<String> {
            None
        }

        fn stored_token(&self) -> Option<String> {
            None
        }
    }

    fn fetched(candles: Vec<Candle>) -> CandleFetchResult {
        CandleFetchResult {
            candles,
            cache_status: CacheStatus::Miss,
            stale: false,
            dropped_rows: 0,
        }
    }

    fn live_series(count: i64, close: f64) -> Vec<Candle> {
        let bucket_secs = Timeframe::M5.bucket_ms() / 1_000;
        let last = (NOW_MS / 1_000).div_euclid(bucket_secs) * bucket_secs;
        (0..count)
            .map(|offset| Candle::flat(last - (count - 1 - offset) * bucket_secs, close))
            .collect()
    }

    struct Harness {
        engine: Arc<ChartEngine>,
        surface: Arc<RecordingSurface>,
        provider: Arc<ScriptedProvider>,
        clock: Arc<ManualClock>,
        positions: Arc<PositionBook>,
        sink: Arc<RecordingSink>,
    }

    fn harness_with(provider: ScriptedProvider, session_cache: Option<SqlitePool>) -> Harness {
        let surface = Arc::new(RecordingSurface::default());
        let provider = Arc::new(provider);
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let positions = Arc::new(PositionBook::default());
        let sink = Arc::new(RecordingSink::default());
        let tokens = Arc::new(TokenCache::new(Arc::new(FixedToken), clock.clone()));
        let config = ChartSessionConfig::default();
        let status = Arc::new(RwLock::new(MarketStreamStatusSnapshot::disconnected(
            &config.key(),
            None,
        )));

        let engine = ChartEngine::new(
            config,
            ChartEngineDeps {
                provider: provider.clone(),
                mark_sink: Some(sink.clone()),
                tokens: Some(tokens),
                positions: positions.clone(),
                clock: clock.clone(),
                surface: surface.clone(),
                session_cache,
            },
            status,
            CancellationToken::new(),
        );

        Harness {
            engine,
            surface,
            provider,
            clock,
            positions,
            sink,
        }
    }

    fn harness(provider: ScriptedProvider) -> Harness {
        harness_with(provider, None)
    }

    #[test]
    fn paints_simulated_series_when_nothing_is_known() {
        let h = harness(ScriptedProvider::default());
        assert_eq!(h.engine.paint_now(), CandleSource::Synthetic);

        let frames = h.surface.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].simulated);
        assert_eq!(frames[0].candles.len(), 300);
        assert_eq!(h.surface.notices(), vec![NoticeKind::Simulated]);
    }

    #[test]
    fn prefers_ticks_over_synthetic() {
        let h = harness(ScriptedProvider::default());
        h.engine.on_tick("EURUSD", Tick { t: NOW_MS - 1_000, p: 1.0850 });

        assert_eq!(h.engine.paint_now(), CandleSource::Ticks);
        let frame = h.surface.frames().pop().expect("frame should be painted");
        assert!(!frame.simulated);
        assert_eq!(frame.candles.last().map(|candle| candle.close), Some(1.0850));
    }

    #[test]
    fn prefers_cache_over_ticks_and_flags_staleness() {
        let h = harness(ScriptedProvider::default());
        let key = h.engine.key();
        h.engine.on_tick("EURUSD", Tick { t: NOW_MS - 1_000, p: 1.0850 });
        h.engine.inner.lock().cache.put(
            key,
            CacheEntry {
                fetched_at: NOW_MS - 120_000,
                candles: live_series(3, 1.2),
                source: CandleSource::Live,
            },
        );

        assert_eq!(h.engine.paint_now(), CandleSource::Cache);
        let frame = h.surface.frames().pop().expect("frame should be painted");
        assert!(frame.stale);
        assert_eq!(frame.candles, live_series(3, 1.2));
    }

    #[tokio::test]
    async fn successful_refresh_repaints_and_fresh_cache_skips_network() {
        let h = harness(ScriptedProvider::with(vec![Ok(fetched(live_series(5, 1.1)))]));

        assert_eq!(
            h.engine.refresh(false).await,
            RefreshOutcome::Updated { candles: 5 }
        );
        let frame = h.surface.frames().pop().expect("live frame");
        assert_eq!(frame.source, CandleSource::Live);

        h.clock.advance(30_000);
        assert_eq!(h.engine.refresh(false).await, RefreshOutcome::SkippedFresh);
        h.clock.advance(30_000);
        assert_eq!(h.engine.refresh(false).await, RefreshOutcome::NoData);
        assert_eq!(h.provider.requests.lock().len(), 2);
        assert_eq!(h.engine.series(), live_series(5, 1.1));
    }

    #[tokio::test]
    async fn forced_refresh_bypasses_freshness() {
        let h = harness(ScriptedProvider::with(vec![
            Ok(fetched(live_series(2, 1.1))),
            Ok(fetched(live_series(2, 1.2))),
        ]));
        h.engine.refresh(false).await;

        assert_eq!(
            h.engine.refresh(true).await,
            RefreshOutcome::Updated { candles: 2 }
        );
        let requests = h.provider.requests.lock();
        assert!(requests[1].force_fresh);
    }

    #[tokio::test]
    async fn rate_limit_pushes_next_poll_past_retry_after() {
        let h = harness(ScriptedProvider::with(vec![Err(AppError::RateLimited {
            retry_after: Duration::from_secs(10),
        })]));
        h.engine.paint_now();

        assert_eq!(
            h.engine.refresh(false).await,
            RefreshOutcome::RateLimited {
                retry_after: Duration::from_secs(10)
            }
        );
        assert!(h.engine.next_poll_delay() >= Duration::from_secs(10));
        assert!(h
            .surface
            .notices()
            .contains(&NoticeKind::RateLimited { retry_after_ms: 10_000 }));
        assert_eq!(
            h.surface.frames().last().map(|frame| frame.source),
            Some(CandleSource::Synthetic)
        );
    }

    #[tokio::test]
    async fn failed_fetch_keeps_series_and_surfaces_notice() {
        let h = harness(ScriptedProvider::with(vec![
            Ok(fetched(live_series(3, 1.1))),
            Err(AppError::FetchFailed {
                status: Some(502),
                code: "upstream_unavailable".to_string(),
                message: "bad gateway".to_string(),
            }),
        ]));
        h.engine.refresh(false).await;

        assert_eq!(
            h.engine.refresh(true).await,
            RefreshOutcome::Failed {
                code: "upstream_unavailable".to_string()
            }
        );
        assert_eq!(h.engine.series(), live_series(3, 1.1));
        assert!(matches!(
            h.surface.notices().last(),
            Some(NoticeKind::FetchFailed { code, .. }) if code == "upstream_unavailable"
        ));
    }

    #[tokio::test]
    async fn late_response_never_overwrites_new_chart() {
        let h = harness(ScriptedProvider::gated(vec![Ok(fetched(live_series(4, 1.1)))]));
        h.engine.paint_now();

        let pending = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.refresh(false).await }
        });
        h.provider.entered.notified().await;

        assert_eq!(h.engine.refresh(false).await, RefreshOutcome::SkippedInFlight);
        assert!(h.engine.select("GBPUSD", Timeframe::M5).await);
        if let Some(gate) = &h.provider.gate {
            gate.notify_one();
        }

        let outcome = pending.await.expect("refresh task should not panic");
        assert_eq!(outcome, RefreshOutcome::Discarded);
        assert_eq!(h.engine.key(), ChartKey::new("GBPUSD", Timeframe::M5));
        assert!(h
            .surface
            .frames()
            .iter()
            .all(|frame| frame.source != CandleSource::Live));
        assert!(h.engine.inner.lock().cache.is_empty());
    }

    #[tokio::test]
    async fn dropped_refresh_releases_the_in_flight_slot() {
        let h = harness(ScriptedProvider::gated(vec![Ok(fetched(live_series(3, 1.1)))]));

        let abandoned = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.refresh(true).await }
        });
        h.provider.entered.notified().await;
        abandoned.abort();
        assert!(abandoned.await.is_err());
        assert!(h.engine.inner.lock().in_flight.is_none());

        if let Some(gate) = &h.provider.gate {
            gate.notify_one();
        }
        h.clock.advance(3_600_000);
        assert_eq!(
            h.engine.refresh(true).await,
            RefreshOutcome::Updated { candles: 3 }
        );
    }

    #[tokio::test]
    async fn forced_refresh_supersedes_outstanding_poll() {
        let h = harness(ScriptedProvider::gated(vec![Ok(fetched(live_series(4, 1.2)))]));
        h.engine.paint_now();

        let poll = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.refresh(false).await }
        });
        h.provider.entered.notified().await;

        let forced = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.refresh(true).await }
        });
        h.provider.entered.notified().await;
        assert_eq!(
            poll.await.expect("poll task should not panic"),
            RefreshOutcome::Discarded
        );

        if let Some(gate) = &h.provider.gate {
            gate.notify_one();
        }
        assert_eq!(
            forced.await.expect("forced task should not panic"),
            RefreshOutcome::Updated { candles: 4 }
        );
        assert_eq!(h.engine.series(), live_series(4, 1.2));
        let requests = h.provider.requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].force_fresh);
    }

    #[tokio::test]
    async fn becoming_visible_does_not_jump_a_rate_limit() {
        let h = harness(ScriptedProvider::with(vec![Err(AppError::RateLimited {
            retry_after: Duration::from_secs(10),
        })]));
        h.engine.set_visible(false);
        let token = h.engine.cancellation_token();
        let task = tokio::spawn(Arc::clone(&h.engine).run(None));

        tokio::time::timeout(Duration::from_secs(5), h.provider.entered.notified())
            .await
            .expect("poll loop should fetch");
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.engine.set_visible(true);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.provider.requests.lock().len(), 1);
        assert_eq!(
            h.engine.refresh(true).await,
            RefreshOutcome::SkippedRateLimited {
                retry_after: Duration::from_secs(10)
            }
        );
        assert_eq!(h.engine.next_poll_delay(), Duration::from_secs(10));

        h.clock.advance(10_000);
        assert_eq!(h.engine.refresh(false).await, RefreshOutcome::NoData);
        assert_eq!(h.provider.requests.lock().len(), 2);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session should stop")
            .expect("session task should not panic");
    }

    #[test]
    fn live_ticks_are_conflated_last_value_wins() {
        let h = harness(ScriptedProvider::default());
        h.engine.on_tick("EURUSD", Tick { t: NOW_MS, p: 1.1000 });
        for step in 1..=50 {
            h.engine.on_tick(
                "EURUSD",
                Tick {
                    t: NOW_MS + step,
                    p: 1.1000 + step as f64 * 0.00001,
                },
            );
        }

        let update = h.engine.drain_frame().expect("pending update");
        assert_eq!(
            update.price,
            Some(Tick {
                t: NOW_MS + 50,
                p: 1.1000 + 50.0 * 0.00001
            })
        );
        let candle = update.candle.expect("tail candle update");
        assert!((candle.close - 1.1005).abs() < 1e-12);
        assert_eq!(h.engine.drain_frame(), None);
    }

    #[test]
    fn ticks_for_other_instruments_do_not_touch_the_chart() {
        let h = harness(ScriptedProvider::default());
        h.engine.on_tick("GBPUSD", Tick { t: NOW_MS, p: 1.27 });
        assert_eq!(h.engine.drain_frame(), None);
    }

    #[tokio::test]
    async fn throttled_mark_price_push_carries_token_and_idempotency_key() {
        let h = harness(ScriptedProvider::default());
        assert_eq!(
            h.engine.on_tick("EURUSD", Tick { t: NOW_MS, p: 1.1 }),
            Some(PushDecision::NoOpenPosition)
        );

        h.positions.set_open_positions("EURUSD", 1);
        h.clock.advance(1);
        assert_eq!(
            h.engine.on_tick("EURUSD", Tick { t: NOW_MS + 1, p: 1.1001 }),
            Some(PushDecision::Push)
        );
        assert!(matches!(
            h.engine.on_tick("EURUSD", Tick { t: NOW_MS + 2, p: 1.1002 }),
            Some(PushDecision::TooSoon { .. })
        ));

        tokio::time::timeout(Duration::from_secs(5), h.sink.pushed.notified())
            .await
            .expect("mark price should be pushed");
        let reports = h.sink.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0.asset, "EURUSD");
        assert_eq!(reports[0].1, "session-token");
        assert_eq!(
            reports[0].0.idempotency_key,
            format!("EURUSD:1.10010:{}", NOW_MS + 1)
        );
    }

    #[test]
    fn poll_delay_follows_visibility_and_jitter_bounds() {
        assert_eq!(
            poll_delay(Timeframe::M1, true, None, 0.0),
            Duration::from_secs(15)
        );
        assert_eq!(
            poll_delay(Timeframe::M1, true, None, 5.0),
            Duration::from_millis(16_500)
        );
        assert_eq!(
            poll_delay(Timeframe::M1, false, None, 0.0),
            HIDDEN_POLL_INTERVAL
        );
        assert_eq!(
            poll_delay(Timeframe::M1, true, Some(Duration::from_secs(10)), 0.1),
            Duration::from_secs(10)
        );
        assert_eq!(
            poll_delay(Timeframe::M1, false, Some(Duration::from_secs(10)), 0.0),
            HIDDEN_POLL_INTERVAL
        );
    }

    #[test]
    fn status_throttle_suppresses_repeated_errors() {
        let throttle = Mutex::new(StatusPublishThrottle::default());
        let reason = Some("connect error".to_string());
        assert!(allow_status_publish(&throttle, ConnectionState::Error, &reason));
        assert!(!allow_status_publish(&throttle, ConnectionState::Error, &reason));
        assert!(allow_status_publish(&throttle, ConnectionState::Open, &None));
    }

    #[tokio::test]
    async fn teardown_persists_session_and_clears_stores() {
        let pool = initialize_in_memory_pool()
            .await
            .expect("in-memory pool should initialize");
        let h = harness_with(
            ScriptedProvider::with(vec![Ok(fetched(live_series(3, 1.1)))]),
            Some(pool.clone()),
        );
        h.engine.on_tick("EURUSD", Tick { t: NOW_MS, p: 1.1 });
        h.engine.refresh(false).await;

        h.engine.teardown().await;
        assert!(h.engine.cancellation_token().is_cancelled());
        assert!(h.engine.series().is_empty());
        assert!(h.engine.inner.lock().cache.is_empty());

        let restored = harness_with(ScriptedProvider::default(), Some(pool));
        restored.engine.restore_session().await;
        assert_eq!(restored.engine.paint_now(), CandleSource::Cache);
        assert_eq!(restored.engine.series(), live_series(3, 1.1));
        assert_eq!(restored.engine.inner.lock().ticks.len("EURUSD"), 1);

        // A restored series still reconciles against the network.
        assert_eq!(restored.engine.refresh(false).await, RefreshOutcome::NoData);
        assert_eq!(restored.provider.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn run_without_socket_polls_and_stops_on_cancel() {
        let h = harness(ScriptedProvider::with(vec![Ok(fetched(live_series(2, 1.1)))]));
        let token = h.engine.cancellation_token();
        let task = tokio::spawn(Arc::clone(&h.engine).run(None));

        tokio::time::timeout(Duration::from_secs(5), h.provider.entered.notified())
            .await
            .expect("poll loop should fetch");
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session should stop")
            .expect("session task should not panic");

        let status = h.engine.status.read().await.clone();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(h
            .surface
            .frames()
            .iter()
            .any(|frame| frame.source == CandleSource::Live));
    }
}
