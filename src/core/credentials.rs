//! Granola access credential lifecycle.
//!
//! The credential is written exactly once per successful authorization and is
//! never mutated in place. Reads go through the freshness check: a token
//! inside the one-minute expiry margin is reported as absent, which pushes
//! callers back through the full authorization flow.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::storage::KvStore;

pub const ACCESS_TOKEN_KEY: &str = "granola_access_token";
pub const REFRESH_TOKEN_KEY: &str = "granola_refresh_token";
pub const TOKEN_EXPIRY_KEY: &str = "granola_token_expiry";

const TOKEN_FRESHNESS_MARGIN_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCredential {
    pub access_token: String,
    /// Stored verbatim for a future refresh grant; empty when the server
    /// omits it. No refresh flow is implemented — expiry forces a full
    /// re-authorization.
    pub refresh_token: String,
    pub expires_at_epoch_ms: i64,
}

pub fn current_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KvStore>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token_at(current_epoch_ms())
    }

    pub fn access_token_at(&self, now_ms: i64) -> Option<String> {
        let token = self.store.get(ACCESS_TOKEN_KEY).ok()??;
        if token.is_empty() {
            return None;
        }
        let expires_at = self
            .store
            .get(TOKEN_EXPIRY_KEY)
            .ok()
            .flatten()
            .and_then(|raw| raw.parse::<i64>().ok());
        match expires_at {
            Some(expires_at) if now_ms >= expires_at - TOKEN_FRESHNESS_MARGIN_MS => None,
            _ => Some(token),
        }
    }

    /// Writes all three credential keys in a single storage write.
    pub fn store(&self, credential: &AccessCredential) -> Result<(), String> {
        self.store.set_many(&[
            (ACCESS_TOKEN_KEY, credential.access_token.clone()),
            (REFRESH_TOKEN_KEY, credential.refresh_token.clone()),
            (TOKEN_EXPIRY_KEY, credential.expires_at_epoch_ms.to_string()),
        ])
    }

    pub fn clear(&self) -> Result<(), String> {
        self.store
            .remove_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, TOKEN_EXPIRY_KEY])
    }
}
