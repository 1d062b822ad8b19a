use crate::config::EngineSettings;
use crate::db::initialize_pool;
use crate::error::AppError;
use crate::market::auth::{StoredTokenSource, TokenCache, TokenSource};
use crate::market::clock::{Clock, SystemClock};
use crate::market::pipeline::{BroadcastSurface, ChartEngine, ChartEngineDeps, ChartEvent};
use crate::market::rest::{CandleProvider, MarkPriceSink, RestClient};
use crate::market::throttle::PositionBook;
use crate::market::types::{ChartSessionConfig, MarketStreamStatusSnapshot};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHART_EVENT_CAPACITY: usize = 512;

pub struct ChartSessionHandle {
    pub engine: Arc<ChartEngine>,
    pub live_socket: bool,
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub settings: EngineSettings,
    pub db_pool: SqlitePool,
    pub provider: Arc<dyn CandleProvider>,
    pub mark_sink: Arc<dyn MarkPriceSink>,
    pub tokens: Arc<TokenCache>,
    pub positions: Arc<PositionBook>,
    pub clock: Arc<dyn Clock>,
    pub surface: Arc<BroadcastSurface>,
    pub chart_session: Mutex<Option<ChartSessionHandle>>,
    pub chart_status: Arc<RwLock<MarketStreamStatusSnapshot>>,
}

impl AppState {
    /// Wires the REST client, token cache and session cache from `settings`.
    pub async fn initialize(settings: EngineSettings) -> Result<Self, AppError> {
        let db_pool = initialize_pool(settings.session_db.as_deref()).await?;
        let rest = Arc::new(RestClient::new(
            settings.build_http_client()?,
            settings.api_base_url.clone(),
            settings.market.clone(),
        ));
        let token_source: Arc<dyn TokenSource> =
            Arc::new(StoredTokenSource::new(settings.api_token.clone()));

        Ok(Self::new(
            settings,
            db_pool,
            rest.clone(),
            rest,
            token_source,
            Arc::new(SystemClock),
        ))
    }

    pub fn new(
        settings: EngineSettings,
        db_pool: SqlitePool,
        provider: Arc<dyn CandleProvider>,
        mark_sink: Arc<dyn MarkPriceSink>,
        token_source: Arc<dyn TokenSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let idle = ChartSessionConfig::default();
        let chart_status =
            MarketStreamStatusSnapshot::disconnected(&idle.key(), Some("chart idle".to_string()));

        Self {
            started_at: Instant::now(),
            settings,
            db_pool,
            provider,
            mark_sink,
            tokens: Arc::new(TokenCache::new(token_source, Arc::clone(&clock))),
            positions: Arc::new(PositionBook::default()),
            clock,
            surface: Arc::new(BroadcastSurface::new(CHART_EVENT_CAPACITY)),
            chart_session: Mutex::new(None),
            chart_status: Arc::new(RwLock::new(chart_status)),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChartEvent> {
        self.surface.subscribe()
    }

    pub fn engine_deps(&self) -> ChartEngineDeps {
        ChartEngineDeps {
            provider: Arc::clone(&self.provider),
            mark_sink: Some(Arc::clone(&self.mark_sink)),
            tokens: Some(Arc::clone(&self.tokens)),
            positions: self.positions.clone(),
            clock: Arc::clone(&self.clock),
            surface: self.surface.clone(),
            session_cache: Some(self.db_pool.clone()),
        }
    }
}
