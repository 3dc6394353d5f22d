//! The multi-step "list then fetch details" session against the Granola MCP
//! tools.
//!
//! The remote `list_meetings` tool mishandles date-range arguments on some
//! deployments, so the session re-queries once with empty arguments before it
//! concludes the list is actually empty. The re-query is bounded: at most one
//! extra list call, never a third.

use chrono::{Days, Local, NaiveDate};
use serde_json::{json, Value};
use tracing::debug;

use super::records::{parse_meeting_records, MeetingRecord};
use super::{NOT_AUTHENTICATED, SESSION_EXPIRED};
use crate::core::credentials::TokenStore;
use crate::mcp::client_initialize_params;
use crate::mcp::transport::{RpcOutcome, RpcTransport};

const DEFAULT_LOOKBACK_DAYS: u64 = 30;

#[derive(Debug, Default)]
pub struct MeetingsOutcome {
    pub meetings: Vec<MeetingRecord>,
    pub error: Option<String>,
}

pub struct MeetingsSession<'a> {
    transport: &'a dyn RpcTransport,
    tokens: &'a TokenStore,
}

impl<'a> MeetingsSession<'a> {
    pub fn new(transport: &'a dyn RpcTransport, tokens: &'a TokenStore) -> Self {
        Self { transport, tokens }
    }

    /// Never returns an error value to the caller; every failure inside the
    /// session is converted to an outcome with an `error` string.
    pub async fn list(
        &self,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> MeetingsOutcome {
        let Some(token) = self.tokens.access_token() else {
            return MeetingsOutcome {
                meetings: Vec::new(),
                error: Some(NOT_AUTHENTICATED.to_string()),
            };
        };
        match self.list_inner(&token, date_from, date_to).await {
            Ok(meetings) => MeetingsOutcome {
                meetings,
                error: None,
            },
            Err(message) => MeetingsOutcome {
                meetings: Vec::new(),
                error: Some(message),
            },
        }
    }

    async fn list_inner(
        &self,
        token: &str,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Vec<MeetingRecord>, String> {
        match self
            .transport
            .send("initialize", client_initialize_params(), Some(token))
            .await?
        {
            // Locally the credential looked valid; the server disagrees.
            RpcOutcome::AuthRequired(_) => return Err(SESSION_EXPIRED.to_string()),
            RpcOutcome::Result(_) => {}
        }

        let today = Local::now().date_naive();
        let date_to = date_to.unwrap_or(today);
        let date_from = date_from.unwrap_or_else(|| {
            today
                .checked_sub_days(Days::new(DEFAULT_LOOKBACK_DAYS))
                .unwrap_or(today)
        });
        let dated_args = json!({
            "date_from": date_from.format("%Y-%m-%d").to_string(),
            "date_to": date_to.format("%Y-%m-%d").to_string(),
        });

        let first = self.call_tool(token, "list_meetings", dated_args).await?;
        let first_text = first_text_content(&first);
        let stubs = if first_text.trim().is_empty() {
            let second = self.call_tool(token, "list_meetings", json!({})).await?;
            parse_meeting_records(&first_text_content(&second))
        } else {
            let parsed = parse_meeting_records(&first_text);
            if parsed.is_empty() {
                let second = self.call_tool(token, "list_meetings", json!({})).await?;
                parse_meeting_records(&first_text_content(&second))
            } else {
                parsed
            }
        };
        if stubs.is_empty() {
            return Ok(Vec::new());
        }

        // Details are fetched one at a time, in list order; a stalled or
        // failed fetch only costs that meeting its notes.
        let mut meetings = Vec::with_capacity(stubs.len());
        for mut stub in stubs {
            if !stub.id.is_empty() {
                match self.fetch_notes(token, &stub.id).await {
                    Ok(Some(notes)) if !notes.is_empty() => {
                        stub.notes = notes.clone();
                        stub.content = notes;
                    }
                    Ok(_) => {}
                    Err(message) => {
                        debug!(meeting_id = %stub.id, error = %message, "keeping stub after detail fetch failure");
                    }
                }
            }
            meetings.push(stub);
        }
        Ok(meetings)
    }

    async fn call_tool(&self, token: &str, name: &str, arguments: Value) -> Result<Value, String> {
        let params = json!({"name": name, "arguments": arguments});
        match self.transport.send("tools/call", params, Some(token)).await? {
            RpcOutcome::AuthRequired(_) => Err(SESSION_EXPIRED.to_string()),
            RpcOutcome::Result(value) => Ok(value),
        }
    }

    async fn fetch_notes(&self, token: &str, meeting_id: &str) -> Result<Option<String>, String> {
        let result = self
            .call_tool(token, "get_meetings", json!({"meeting_ids": [meeting_id]}))
            .await?;
        let text = first_text_content(&result);
        if text.trim().is_empty() {
            return Ok(None);
        }
        let parsed = parse_meeting_records(&text);
        let found = parsed
            .iter()
            .find(|record| record.id == meeting_id)
            .or_else(|| parsed.first());
        Ok(Some(match found {
            Some(record) if !record.notes.is_empty() => record.notes.clone(),
            Some(record) if !record.content.is_empty() => record.content.clone(),
            _ => text,
        }))
    }
}

/// First text part of a tool result. Tool results are usually
/// `{content: [{type: "text", text}]}` but bare strings appear too.
pub(crate) fn first_text_content(result: &Value) -> String {
    if let Some(text) = result.as_str() {
        return text.to_string();
    }
    result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .find(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        })
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}
