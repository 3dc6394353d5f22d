//! Chat grounding against the Granola MCP tools: discover the service's chat
//! tool, invoke it exactly once with the user's question, and hand back the
//! returned context text.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{NOT_AUTHENTICATED, SESSION_EXPIRED};
use crate::core::credentials::TokenStore;
use crate::mcp::client_initialize_params;
use crate::mcp::transport::{RpcOutcome, RpcTransport};

pub const PREFERRED_CHAT_TOOL: &str = "query_granola_meetings";
pub const EXACT_CHAT_TOOL: &str = "chat_with_granola";

const ARGUMENT_KEYS: [&str; 6] = ["query", "question", "prompt", "message", "input", "text"];

#[derive(Debug, Default)]
pub struct ChatOutcome {
    pub context_text: Option<String>,
    pub error: Option<String>,
    /// Set when a (re-)authentication would make a retry worthwhile. The
    /// caller owns the retry: exactly one re-auth, then exactly one repeat.
    pub needs_auth: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<Value>,
}

enum AskError {
    NeedsAuth(String),
    Failed(String),
}

pub struct ChatToolSession<'a> {
    transport: &'a dyn RpcTransport,
    tokens: &'a TokenStore,
}

impl<'a> ChatToolSession<'a> {
    pub fn new(transport: &'a dyn RpcTransport, tokens: &'a TokenStore) -> Self {
        Self { transport, tokens }
    }

    pub async fn ask(&self, query: &str) -> ChatOutcome {
        let Some(token) = self.tokens.access_token() else {
            return ChatOutcome {
                context_text: None,
                error: Some(NOT_AUTHENTICATED.to_string()),
                needs_auth: true,
            };
        };
        match self.ask_inner(&token, query).await {
            Ok(context_text) => ChatOutcome {
                context_text: Some(context_text),
                error: None,
                needs_auth: false,
            },
            Err(AskError::NeedsAuth(message)) => ChatOutcome {
                context_text: None,
                error: Some(message),
                needs_auth: true,
            },
            Err(AskError::Failed(message)) => ChatOutcome {
                context_text: None,
                error: Some(message),
                needs_auth: false,
            },
        }
    }

    async fn ask_inner(&self, token: &str, query: &str) -> Result<String, AskError> {
        match self.send(token, "initialize", client_initialize_params()).await? {
            RpcOutcome::AuthRequired(_) => {
                return Err(AskError::NeedsAuth(SESSION_EXPIRED.to_string()))
            }
            RpcOutcome::Result(_) => {}
        }

        let tools = match self.send(token, "tools/list", json!({})).await? {
            RpcOutcome::AuthRequired(_) => {
                return Err(AskError::NeedsAuth(SESSION_EXPIRED.to_string()))
            }
            RpcOutcome::Result(value) => tool_descriptors(&value),
        };
        let Some(tool) = select_chat_tool(&tools) else {
            return Err(AskError::Failed(
                "Granola chat tool not found in MCP tools/list.".to_string(),
            ));
        };

        let question = grounding_question(query);
        let params = json!({
            "name": tool.name,
            "arguments": build_chat_tool_args(tool, &question),
        });
        // Exactly one chat tool call.
        let result = match self.send(token, "tools/call", params).await? {
            RpcOutcome::AuthRequired(_) => {
                return Err(AskError::NeedsAuth(SESSION_EXPIRED.to_string()))
            }
            RpcOutcome::Result(value) => value,
        };

        let context_text = extract_tool_text(&result);
        if context_text.is_empty() {
            return Err(AskError::Failed(
                "Granola returned no context text.".to_string(),
            ));
        }
        Ok(context_text)
    }

    async fn send(&self, token: &str, method: &str, params: Value) -> Result<RpcOutcome, AskError> {
        self.transport
            .send(method, params, Some(token))
            .await
            .map_err(AskError::Failed)
    }
}

fn tool_descriptors(result: &Value) -> Vec<ToolDescriptor> {
    result
        .get("tools")
        .cloned()
        .and_then(|tools| serde_json::from_value(tools).ok())
        .unwrap_or_default()
}

/// Priority match: the two known tool names first, then a name mentioning
/// both the domain and "chat", then anything chat-shaped at all.
pub fn select_chat_tool(tools: &[ToolDescriptor]) -> Option<&ToolDescriptor> {
    tools
        .iter()
        .find(|tool| tool.name == PREFERRED_CHAT_TOOL)
        .or_else(|| tools.iter().find(|tool| tool.name == EXACT_CHAT_TOOL))
        .or_else(|| {
            tools.iter().find(|tool| {
                let name = tool.name.to_lowercase();
                name.contains("chat") && name.contains("granola")
            })
        })
        .or_else(|| {
            tools
                .iter()
                .find(|tool| tool.name.to_lowercase().contains("chat"))
        })
}

/// Picks the argument key the tool's input schema actually declares,
/// defaulting to `query` when the schema names none of the usual suspects.
pub fn build_chat_tool_args(tool: &ToolDescriptor, question: &str) -> Value {
    let properties = tool
        .input_schema
        .as_ref()
        .and_then(|schema| schema.get("properties"))
        .and_then(Value::as_object);
    let key = properties
        .and_then(|props| {
            ARGUMENT_KEYS
                .iter()
                .find(|key| props.contains_key(**key))
                .copied()
        })
        .unwrap_or("query");
    json!({ key: question })
}

/// Plain text of a tool result: a bare string, the text parts of a content
/// array joined with a blank line, or a `text` field.
pub fn extract_tool_text(result: &Value) -> String {
    if let Some(text) = result.as_str() {
        return text.trim().to_string();
    }
    if let Some(items) = result.get("content").and_then(Value::as_array) {
        let parts: Vec<String> = items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect();
        if !parts.is_empty() {
            return parts.join("\n\n");
        }
    }
    result
        .get("text")
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

pub fn grounding_question(user_query: &str) -> String {
    [
        "Use my Granola meeting context to answer this user request.".to_string(),
        format!("User request: {user_query}"),
        "If relevant context is missing, say that explicitly.".to_string(),
    ]
    .join("\n")
}

pub fn compose_grounded_prompt(user_query: &str, granola_context: &str) -> String {
    [
        "You are answering the user by grounding in the provided Granola context.",
        "",
        "## User Original Query",
        user_query,
        "",
        "## Granola Context",
        granola_context,
        "",
        "## Instructions",
        "- Answer the user query directly.",
        "- Ground your response in the Granola Context above.",
        "- If the context is insufficient or uncertain, say so explicitly.",
        "- Do not fabricate details not supported by the context.",
    ]
    .join("\n")
}
