use crate::error::AppError;
use crate::market::clock::Clock;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;

pub const EXPIRY_SKEW_MS: i64 = 60_000;
pub const DEFAULT_TOKEN_TTL_MS: i64 = 300_000;

/// Where bearer tokens come from, in the order the cache consults them.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn current_session(&self) -> Option<String>;
    async fn refresh_session(&self) -> Option<String>;
    fn stored_token(&self) -> Option<String>;
}

/// Token source for hosts without an interactive session: only persisted storage.
#[derive(Debug, Clone, Default)]
pub struct StoredTokenSource {
    token: Option<String>,
}

impl StoredTokenSource {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StoredTokenSource {
    async fn current_session(&self) -> Option<String> {
        None
    }

    async fn refresh_session(&self) -> Option<String> {
        None
    }

    fn stored_token(&self) -> Option<String> {
        self.token.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenCacheEntry {
    pub token: Option<String>,
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct JwtClaimsWire {
    exp: Option<f64>,
}

/// Decodes the `exp` claim of a JWT into epoch milliseconds. Claims that are
/// not a positive, representable instant count as undecodable.
pub fn decode_jwt_expiry_ms(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let mut decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: JwtClaimsWire = simd_json::serde::from_slice(&mut decoded).ok()?;
    let exp_ms = claims.exp? * 1_000.0;
    (exp_ms.is_finite() && exp_ms > 0.0 && exp_ms < i64::MAX as f64).then(|| exp_ms as i64)
}

pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    entry: Mutex<TokenCacheEntry>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            entry: Mutex::new(TokenCacheEntry::default()),
        }
    }

    fn cached(&self, now_ms: i64) -> Option<String> {
        let readable = self.entry.lock();
        let token = readable.token.as_ref()?;
        (now_ms < readable.expires_at.saturating_sub(EXPIRY_SKEW_MS)).then(|| token.clone())
    }

    /// Returns a usable token, or `None` when genuinely unauthenticated.
    pub async fn get_token(&self) -> Option<String> {
        if let Some(token) = self.cached(self.clock.now_ms()) {
            return Some(token);
        }

        let token = match self.source.current_session().await {
            Some(token) => Some(token),
            None => match self.source.refresh_session().await {
                Some(token) => Some(token),
                None => self.source.stored_token(),
            },
        };
        let token = token.filter(|value| !value.trim().is_empty())?;

        let now_ms = self.clock.now_ms();
        let expires_at = decode_jwt_expiry_ms(&token).unwrap_or(now_ms + DEFAULT_TOKEN_TTL_MS);
        *self.entry.lock() = TokenCacheEntry {
            token: Some(token.clone()),
            expires_at,
        };
        Some(token)
    }

    pub async fn require_token(&self) -> Result<String, AppError> {
        self.get_token().await.ok_or(AppError::AuthMissing)
    }

    pub fn invalidate(&self) {
        *self.entry.lock() = TokenCacheEntry::default();
    }

    pub fn snapshot(&self) -> TokenCacheEntry {
        self.entry.lock().clone()
    }
}
