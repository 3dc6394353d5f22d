//! Host-facing facade over the Granola sessions.
//!
//! Every entry point resolves to a plain result struct with an optional
//! `error` string; nothing returns `Err` across this boundary, so embedding
//! surfaces can render outcomes without their own catch layer.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use super::chat::{compose_grounded_prompt, ChatOutcome, ChatToolSession};
use super::meetings::{first_text_content, MeetingsOutcome, MeetingsSession};
use super::records::MeetingRecord;
use super::NOT_AUTHENTICATED;
use crate::core::credentials::{current_epoch_ms, TokenStore};
use crate::core::oauth::{AuthorizationBrowser, OAuthFlow};
use crate::core::storage::KvStore;
use crate::mcp::client_initialize_params;
use crate::mcp::transport::{RpcOutcome, RpcTransport};

pub const MEETINGS_CACHE_KEY: &str = "granola_meetings_cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthStatus {
    pub authenticated: bool,
}

#[derive(Debug, Default)]
pub struct AuthResult {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct MeetingDetail {
    pub meeting: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct GroundedPrompt {
    pub composed_prompt: Option<String>,
    pub error: Option<String>,
}

/// Cached meetings snapshot, refreshed only on explicit fetches.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MeetingsSnapshot {
    pub meetings: Vec<MeetingRecord>,
    pub cached_at: Option<i64>,
}

pub struct GranolaBridge {
    transport: Arc<dyn RpcTransport>,
    store: Arc<dyn KvStore>,
    tokens: TokenStore,
    resource: String,
}

impl GranolaBridge {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        store: Arc<dyn KvStore>,
        resource: impl Into<String>,
    ) -> Self {
        let tokens = TokenStore::new(store.clone());
        Self {
            transport,
            store,
            tokens,
            resource: resource.into(),
        }
    }

    pub fn check_auth(&self) -> AuthStatus {
        AuthStatus {
            authenticated: self.tokens.access_token().is_some(),
        }
    }

    pub async fn authenticate(&self, browser: &dyn AuthorizationBrowser) -> AuthResult {
        let flow = OAuthFlow::new(self.transport.as_ref(), &self.tokens, self.resource.clone());
        match flow.authenticate(browser).await {
            Ok(()) => AuthResult {
                success: true,
                error: None,
            },
            Err(failure) => {
                warn!(stage = ?failure.stage, error = %failure.message, "Granola authentication failed");
                AuthResult {
                    success: false,
                    error: Some(failure.message),
                }
            }
        }
    }

    pub fn deauthenticate(&self) -> AuthResult {
        match self.tokens.clear() {
            Ok(()) => AuthResult {
                success: true,
                error: None,
            },
            Err(message) => AuthResult {
                success: false,
                error: Some(message),
            },
        }
    }

    pub async fn list_meetings(
        &self,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> MeetingsOutcome {
        MeetingsSession::new(self.transport.as_ref(), &self.tokens)
            .list(date_from, date_to)
            .await
    }

    pub async fn fetch_and_cache_meetings(
        &self,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> MeetingsOutcome {
        let outcome = self.list_meetings(date_from, date_to).await;
        if outcome.error.is_none() {
            let snapshot = MeetingsSnapshot {
                meetings: outcome.meetings.clone(),
                cached_at: Some(current_epoch_ms()),
            };
            match serde_json::to_string(&snapshot) {
                Ok(encoded) => {
                    if let Err(message) = self.store.set(MEETINGS_CACHE_KEY, &encoded) {
                        warn!(error = %message, "failed to persist meetings cache");
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode meetings cache"),
            }
        }
        outcome
    }

    /// The snapshot as last fetched; no network call.
    pub fn cached_meetings(&self) -> MeetingsSnapshot {
        self.store
            .get(MEETINGS_CACHE_KEY)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub async fn meeting_detail(&self, meeting_id: &str) -> MeetingDetail {
        let Some(token) = self.tokens.access_token() else {
            return MeetingDetail {
                meeting: None,
                error: Some(NOT_AUTHENTICATED.to_string()),
            };
        };
        match self.meeting_detail_inner(&token, meeting_id).await {
            Ok(text) => MeetingDetail {
                meeting: Some(text),
                error: None,
            },
            Err(message) => MeetingDetail {
                meeting: None,
                error: Some(message),
            },
        }
    }

    async fn meeting_detail_inner(&self, token: &str, meeting_id: &str) -> Result<String, String> {
        match self
            .transport
            .send("initialize", client_initialize_params(), Some(token))
            .await?
        {
            RpcOutcome::AuthRequired(_) => return Err(super::SESSION_EXPIRED.to_string()),
            RpcOutcome::Result(_) => {}
        }
        let params = json!({
            "name": "get_meetings",
            "arguments": {"meeting_ids": [meeting_id]},
        });
        let result = match self.transport.send("tools/call", params, Some(token)).await? {
            RpcOutcome::AuthRequired(_) => return Err(super::SESSION_EXPIRED.to_string()),
            RpcOutcome::Result(value) => value,
        };
        let text = first_text_content(&result);
        if text.trim().is_empty() {
            return Err("No meeting data".to_string());
        }
        Ok(text)
    }

    pub async fn ask(&self, query: &str) -> ChatOutcome {
        ChatToolSession::new(self.transport.as_ref(), &self.tokens)
            .ask(query)
            .await
    }

    /// Grounds a user query in meeting context and composes the final prompt.
    /// On an auth signal this re-authenticates exactly once and repeats the
    /// ask exactly once.
    pub async fn grounded_prompt(
        &self,
        query: &str,
        browser: &dyn AuthorizationBrowser,
    ) -> GroundedPrompt {
        let query = query.trim();
        if query.is_empty() {
            return GroundedPrompt {
                composed_prompt: None,
                error: Some("User query is empty.".to_string()),
            };
        }
        let mut outcome = self.ask(query).await;
        if outcome.needs_auth {
            let auth = self.authenticate(browser).await;
            if !auth.success {
                return GroundedPrompt {
                    composed_prompt: None,
                    error: Some(
                        auth.error
                            .unwrap_or_else(|| "Granola authentication failed.".to_string()),
                    ),
                };
            }
            outcome = self.ask(query).await;
        }
        if let Some(error) = outcome.error {
            return GroundedPrompt {
                composed_prompt: None,
                error: Some(error),
            };
        }
        match outcome.context_text {
            Some(context) => GroundedPrompt {
                composed_prompt: Some(compose_grounded_prompt(query, &context)),
                error: None,
            },
            None => GroundedPrompt {
                composed_prompt: None,
                error: Some("Granola returned no context text.".to_string()),
            },
        }
    }
}
