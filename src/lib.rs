pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod state;

pub use commands::{
    health::health,
    market_stream::{
        chart_session_status, refresh_chart, set_chart_visibility, start_chart_session,
        stop_chart_session, switch_chart,
    },
};
pub use config::EngineSettings;
pub use error::AppError;
pub use state::AppState;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
