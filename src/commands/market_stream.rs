use crate::error::AppError;
use crate::market::pipeline::{ChartEngine, RefreshOutcome};
use crate::market::types::{
    normalize_instrument, ChartSessionInfo, ChartSessionStopResult, MarketStreamStatusSnapshot,
    StartChartSessionArgs, SwitchChartArgs,
};
use crate::state::{AppState, ChartSessionHandle};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn running_engine(state: &AppState) -> Result<(Arc<ChartEngine>, bool), AppError> {
    let session_slot = state.chart_session.lock().await;
    session_slot
        .as_ref()
        .map(|handle| (Arc::clone(&handle.engine), handle.live_socket))
        .ok_or_else(|| AppError::InvalidArgument("no chart session is running".to_string()))
}

async fn stop_running_session(state: &AppState) -> bool {
    let existing_handle = {
        let mut session_slot = state.chart_session.lock().await;
        session_slot.take()
    };

    match existing_handle {
        Some(handle) => {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
            true
        }
        None => false,
    }
}

pub async fn start_chart_session(
    state: &AppState,
    args: Option<StartChartSessionArgs>,
) -> Result<ChartSessionInfo, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    stop_running_session(state).await;

    {
        let mut writable = state.chart_status.write().await;
        *writable = MarketStreamStatusSnapshot::disconnected(
            &config.key(),
            Some("chart session starting".to_string()),
        );
    }

    let cancellation_token = CancellationToken::new();
    let engine = ChartEngine::new(
        config.clone(),
        state.engine_deps(),
        Arc::clone(&state.chart_status),
        cancellation_token.clone(),
    );
    let live_socket = state.settings.live_socket_config();
    let has_live_socket = live_socket.is_some();
    let join_handle = tokio::spawn(Arc::clone(&engine).run(live_socket));

    {
        let mut session_slot = state.chart_session.lock().await;
        *session_slot = Some(ChartSessionHandle {
            engine,
            live_socket: has_live_socket,
            cancellation_token,
            join_handle,
        });
    }

    info!(
        instrument = %config.instrument,
        timeframe = config.timeframe.as_str(),
        live_socket = has_live_socket,
        "chart session started"
    );
    Ok(ChartSessionInfo::from_config(&config, has_live_socket))
}

pub async fn stop_chart_session(state: &AppState) -> Result<ChartSessionStopResult, AppError> {
    let stopped = stop_running_session(state).await;
    if stopped {
        info!("chart session stopped");
    }
    Ok(ChartSessionStopResult { stopped })
}

pub async fn chart_session_status(
    state: &AppState,
) -> Result<MarketStreamStatusSnapshot, AppError> {
    let snapshot = state.chart_status.read().await.clone();
    Ok(snapshot)
}

pub async fn switch_chart(
    state: &AppState,
    args: SwitchChartArgs,
) -> Result<ChartSessionInfo, AppError> {
    let (engine, live_socket) = running_engine(state).await?;
    let current = engine.key();
    let instrument = match args.instrument.as_deref() {
        Some(raw) => normalize_instrument(raw)?,
        None => current.instrument,
    };
    let timeframe = args.timeframe.unwrap_or(current.timeframe);

    engine.select(&instrument, timeframe).await;
    Ok(ChartSessionInfo::from_config(&engine.config(), live_socket))
}

pub async fn set_chart_visibility(state: &AppState, visible: bool) -> Result<bool, AppError> {
    let (engine, _) = running_engine(state).await?;
    engine.set_visible(visible);
    Ok(engine.is_visible())
}

pub async fn refresh_chart(state: &AppState, force: Option<bool>) -> Result<RefreshOutcome, AppError> {
    let (engine, _) = running_engine(state).await?;
    Ok(engine.refresh(force.unwrap_or(true)).await)
}
