use crate::error::AppError;
use crate::market::transport::LiveSocketConfig;
use reqwest::Client;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080/api";
pub const DEFAULT_MARKET: &str = "forex";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
const MIN_HTTP_TIMEOUT_MS: u64 = 1_000;
const MAX_HTTP_TIMEOUT_MS: u64 = 120_000;

/// Process-wide engine settings read from `FXCHART_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub api_base_url: String,
    pub market: String,
    /// No live socket is opened when unset; charts then poll only.
    pub ws_url: Option<String>,
    /// Session cache file; in-memory when unset.
    pub session_db: Option<PathBuf>,
    pub http_timeout: Duration,
    /// Bearer token used when the host provides no session.
    pub api_token: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            market: DEFAULT_MARKET.to_string(),
            ws_url: None,
            session_db: None,
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            api_token: None,
        }
    }
}

fn lookup_str<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lookup_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup_str(lookup, name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let timeout_ms = lookup_u64(&lookup, "FXCHART_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS)
            .clamp(MIN_HTTP_TIMEOUT_MS, MAX_HTTP_TIMEOUT_MS);

        Self {
            api_base_url: lookup_str(&lookup, "FXCHART_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            market: lookup_str(&lookup, "FXCHART_MARKET")
                .map(|market| market.to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_MARKET.to_string()),
            ws_url: lookup_str(&lookup, "FXCHART_WS_URL"),
            session_db: lookup_str(&lookup, "FXCHART_SESSION_DB").map(PathBuf::from),
            http_timeout: Duration::from_millis(timeout_ms),
            api_token: lookup_str(&lookup, "FXCHART_API_TOKEN"),
        }
    }

    pub fn build_http_client(&self) -> Result<Client, AppError> {
        Ok(Client::builder().timeout(self.http_timeout).build()?)
    }

    pub fn live_socket_config(&self) -> Option<LiveSocketConfig> {
        self.ws_url
            .as_ref()
            .map(|url| LiveSocketConfig::new(url.clone(), self.market.clone()))
    }
}
