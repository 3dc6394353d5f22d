//! JSON-RPC transport for the Granola MCP endpoint.

pub mod sse;
pub mod transport;

use serde_json::json;

pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

pub(crate) const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub(crate) const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub(crate) const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

/// Parameters for the `initialize` request every session opens with.
pub fn client_initialize_params() -> serde_json::Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "notula",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}
