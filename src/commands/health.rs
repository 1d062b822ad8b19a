use crate::{error::AppError, state::AppState};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_ms: u128,
    pub session_cache: &'static str,
    pub chart_session: bool,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    chart_session: bool,
) -> HealthResponse {
    let cache_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };

    HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_ms: started_at.elapsed().as_millis(),
        session_cache: cache_status,
        chart_session,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let chart_session = state.chart_session.lock().await.is_some();
    Ok(build_health_response(state.started_at, &state.db_pool, chart_session).await)
}
