use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::sse::{decode_event_stream, is_event_stream_content_type, RpcEnvelope};
use super::{MCP_JSON_AND_SSE_ACCEPT, MCP_JSON_CONTENT_TYPE, MCP_PROTOCOL_VERSION,
    MCP_PROTOCOL_VERSION_HEADER};
use crate::core::credentials::current_epoch_ms;

const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 60;

const CHALLENGE_HEADER: &str = "www-authenticate";
/// Some gateway proxies rename the standard challenge header.
const REMAPPED_CHALLENGE_HEADER: &str = "x-amzn-remapped-www-authenticate";

/// The server demands authentication. An expected, recoverable condition, so
/// it is a transport outcome rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub www_authenticate: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RpcOutcome {
    Result(Value),
    AuthRequired(AuthChallenge),
}

#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(
        &self,
        method: &str,
        params: Value,
        token: Option<&str>,
    ) -> Result<RpcOutcome, String>;
}

pub struct HttpRpcClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRpcClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| format!("failed to build HTTP client: {err}"))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

/// Request ids only need to be unique within a session; wall-clock
/// milliseconds are enough and double as the SSE correlation key.
fn next_request_id() -> i64 {
    current_epoch_ms()
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(
        &self,
        method: &str,
        params: Value,
        token: Option<&str>,
    ) -> Result<RpcOutcome, String> {
        let request_id = next_request_id();
        let body = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        });
        debug!(url = %self.endpoint, method, request_id, "Sending MCP request");

        let mut request = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", MCP_JSON_CONTENT_TYPE)
            .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
            .header(MCP_PROTOCOL_VERSION_HEADER, MCP_PROTOCOL_VERSION)
            .json(&body);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|err| err.to_string())?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            let www_authenticate = response
                .headers()
                .get(CHALLENGE_HEADER)
                .or_else(|| response.headers().get(REMAPPED_CHALLENGE_HEADER))
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            return Ok(RpcOutcome::AuthRequired(AuthChallenge { www_authenticate }));
        }
        if !status.is_success() {
            return Err(format!(
                "MCP request failed: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            ));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.map_err(|err| err.to_string())?;

        let envelope = if is_event_stream_content_type(&content_type) {
            decode_event_stream(&body, request_id)?
        } else {
            serde_json::from_str::<RpcEnvelope>(&body).map_err(|err| err.to_string())?
        };

        if let Some(error) = envelope.error {
            return Err(error.message.unwrap_or_else(|| "MCP error".to_string()));
        }
        Ok(RpcOutcome::Result(envelope.result.unwrap_or(Value::Null)))
    }
}
