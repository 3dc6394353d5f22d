//! Event-stream decoding for MCP responses.
//!
//! The endpoint answers a POST either with a plain JSON body or with a short
//! `text/event-stream` body whose `data:` lines carry JSON-RPC envelopes. The
//! service does not reliably echo the request id, so matching is permissive:
//! the first envelope that correlates by id or carries a result or error wins.

use serde::Deserialize;
use serde_json::Value;

const SSE_STREAM_TERMINATOR: &str = "[DONE]";

#[derive(Debug, Default, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RpcEnvelope {
    pub fn correlates_with(&self, expected_id: i64) -> bool {
        self.id.as_ref().and_then(Value::as_i64) == Some(expected_id)
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Scans the stream for the response envelope. Malformed lines are skipped,
/// never fatal; an envelope with neither a matching id nor a result/error
/// field is ignored as a stray notification.
pub fn decode_event_stream(text: &str, expected_id: i64) -> Result<RpcEnvelope, String> {
    for line in text.lines() {
        let Some(payload) = sse_data_payload(line) else {
            continue;
        };
        if payload.is_empty() || payload == SSE_STREAM_TERMINATOR {
            continue;
        }
        let Ok(envelope) = serde_json::from_str::<RpcEnvelope>(payload) else {
            continue;
        };
        if envelope.correlates_with(expected_id)
            || envelope.result.is_some()
            || envelope.error.is_some()
        {
            return Ok(envelope);
        }
    }
    Err("no valid JSON-RPC response in SSE stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream_content_type(
            "text/event-stream; charset=utf-8"
        ));
        assert!(is_event_stream_content_type("TEXT/EVENT-STREAM"));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn extracts_sse_payload() {
        assert_eq!(sse_data_payload("data: {\"id\":1}"), Some("{\"id\":1}"));
        assert_eq!(sse_data_payload("data:{\"id\":1}"), Some("{\"id\":1}"));
        assert_eq!(sse_data_payload("event: message"), None);
    }

    #[test]
    fn decode_returns_envelope_matching_request_id() {
        let stream = "data: {\"jsonrpc\":\"2.0\",\"id\":42,\"result\":{\"ok\":true}}\n";
        let envelope = decode_event_stream(stream, 42).expect("envelope should decode");
        assert!(envelope.correlates_with(42));
        assert!(envelope.result.is_some());
    }

    #[test]
    fn decode_skips_malformed_lines_before_valid_one() {
        let stream = concat!(
            "event: message\n",
            "data: not json at all\n",
            "data:\n",
            "data: [DONE]\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"value\":1}}\n",
        );
        let envelope = decode_event_stream(stream, 7).expect("envelope should decode");
        assert_eq!(
            envelope.result.as_ref().and_then(|r| r.get("value")),
            Some(&serde_json::json!(1))
        );
    }

    #[test]
    fn decode_accepts_result_without_matching_id() {
        let stream = "data: {\"jsonrpc\":\"2.0\",\"id\":999,\"result\":{\"ok\":true}}\n";
        let envelope = decode_event_stream(stream, 1).expect("envelope should decode");
        assert!(envelope.result.is_some());
    }

    #[test]
    fn decode_accepts_error_envelope() {
        let stream = "data: {\"jsonrpc\":\"2.0\",\"error\":{\"code\":-32000,\"message\":\"boom\"}}\n";
        let envelope = decode_event_stream(stream, 1).expect("envelope should decode");
        assert_eq!(
            envelope.error.and_then(|error| error.message).as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn decode_without_acceptable_lines_is_an_error() {
        let stream = "event: ping\ndata: garbage\ndata: {\"id\":3}\n";
        let err = decode_event_stream(stream, 1).expect_err("decode should fail");
        assert_eq!(err, "no valid JSON-RPC response in SSE stream");
    }
}
