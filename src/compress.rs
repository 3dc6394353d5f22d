//! Transcript compression into a structured context handoff.
//!
//! One non-streaming chat-completions call against an OpenAI-compatible
//! endpoint. Rate limiting gets a single fixed 15-second backoff and exactly
//! one retry; this is a user-initiated operation, not a high-frequency one,
//! so there is no backoff ladder.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

const COMPRESSION_MAX_TOKENS: u32 = 1500;
const COMPRESSION_TEMPERATURE: f32 = 0.3;
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(15);

const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please wait a minute and try again.";
const INVALID_KEY_MESSAGE: &str =
    "Invalid API key. Get one at https://platform.openai.com/api-keys";
const UNEXPECTED_RESPONSE_MESSAGE: &str = "Unexpected completion response format";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
}

pub fn format_transcript(messages: &[TranscriptMessage]) -> String {
    messages
        .iter()
        .map(|message| {
            let label = if message.role == "user" {
                "User"
            } else {
                "Assistant"
            };
            format!("{label}: {}", message.content)
        })
        .collect::<Vec<String>>()
        .join("\n\n")
}

fn compression_prompt(transcript: &str, timestamp: &str) -> String {
    format!(
        "You are a context compression assistant. Given the following conversation transcript, \
extract and compress it into a structured handoff format that another LLM can use to seamlessly \
continue the conversation.

<conversation>
{transcript}
</conversation>

Output the following structure in markdown. Be concise but preserve critical information. Omit \
sections if not applicable.

## CONTEXT HANDOFF
Generated: {timestamp}

### PROJECT
[1-2 sentences: core topic/goal of this conversation]

### USER PROFILE
- Communication style: [observed preferences - brief/detailed, technical level, tone]
- Explicit instructions: [any direct requests about how to respond]

### KEY DECISIONS
[Bullet list of conclusions reached, choices made, things agreed upon]

### CURRENT STATE
[What was actively being worked on when conversation paused. Be specific.]

### NEXT STEPS
[What should happen next based on conversation flow]

### OPEN QUESTIONS
[Unresolved items, pending decisions, things user seemed uncertain about]

### CRITICAL CONTEXT
[Facts, constraints, or details that would be lost without explicit capture - project names, \
technical specs, deadlines, preferences expressed, etc.]

---
Compress now. Prioritize information density over completeness."
    )
}

pub async fn compress_transcript(
    http: &reqwest::Client,
    api_url: &str,
    api_key: &str,
    model: &str,
    messages: &[TranscriptMessage],
) -> Result<String, String> {
    let transcript = format_transcript(messages);
    let prompt = compression_prompt(&transcript, &Utc::now().to_rfc3339());
    let request = CompletionRequest {
        model,
        messages: vec![RequestMessage {
            role: "user",
            content: &prompt,
        }],
        max_tokens: COMPRESSION_MAX_TOKENS,
        temperature: COMPRESSION_TEMPERATURE,
    };
    let body = serde_json::to_string(&request).map_err(|err| err.to_string())?;

    compress_with_sender(
        || {
            let http = http.clone();
            let api_url = api_url.to_string();
            let api_key = api_key.to_string();
            let body = body.clone();
            async move {
                let response = http
                    .post(&api_url)
                    .header("Content-Type", "application/json")
                    .header("Authorization", format!("Bearer {api_key}"))
                    .body(body)
                    .send()
                    .await
                    .map_err(|err| err.to_string())?;
                let status = response.status().as_u16();
                let text = response.text().await.map_err(|err| err.to_string())?;
                Ok((status, text))
            }
        },
        tokio::time::sleep(RATE_LIMIT_RETRY_DELAY),
    )
    .await
}

/// Request/classify loop, separated from the HTTP plumbing so the single-retry
/// policy is testable without a live endpoint.
async fn compress_with_sender<F, Fut, D>(mut send: F, retry_delay: D) -> Result<String, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(u16, String), String>>,
    D: Future<Output = ()>,
{
    let (mut status, mut body) = send().await?;
    if status == 429 {
        retry_delay.await;
        (status, body) = send().await?;
    }

    let parsed: Option<CompletionResponse> = serde_json::from_str(&body).ok();
    let api_error = |parsed: &Option<CompletionResponse>| {
        parsed
            .as_ref()
            .and_then(|response| response.error.as_ref())
            .and_then(|error| error.message.clone())
    };

    if status == 429 {
        return Err(RATE_LIMIT_MESSAGE.to_string());
    }
    if status == 401 || status == 403 {
        return Err(api_error(&parsed).unwrap_or_else(|| INVALID_KEY_MESSAGE.to_string()));
    }
    if !(200..300).contains(&status) {
        return Err(api_error(&parsed).unwrap_or_else(|| format!("API error: {status}")));
    }

    let data = parsed.ok_or_else(|| UNEXPECTED_RESPONSE_MESSAGE.to_string())?;
    if let Some(error) = data.error {
        return Err(error
            .message
            .unwrap_or_else(|| "Completion API error".to_string()));
    }
    data.choices
        .first()
        .and_then(|choice| choice.message.as_ref())
        .and_then(|message| message.content.as_ref())
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| UNEXPECTED_RESPONSE_MESSAGE.to_string())
}

/// Fallback document saved when compression fails: the error banner plus the
/// raw transcript, so nothing the user captured is lost.
pub fn fallback_handoff(messages: &[TranscriptMessage], error: &str) -> String {
    format!(
        "## CONTEXT HANDOFF (Compression failed)\n\n**Error:** {error}\n\n### Raw transcript\n\n{}",
        format_transcript(messages)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn message(role: &str, content: &str) -> TranscriptMessage {
        TranscriptMessage {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    fn success_body(content: &str) -> String {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
        .to_string()
    }

    #[test]
    fn transcript_labels_roles() {
        let transcript = format_transcript(&[
            message("user", "hello"),
            message("assistant", "hi there"),
        ]);
        assert_eq!(transcript, "User: hello\n\nAssistant: hi there");
    }

    #[tokio::test]
    async fn success_returns_trimmed_content() {
        let result = compress_with_sender(
            || async { Ok((200, success_body("  compressed  "))) },
            async {},
        )
        .await;
        assert_eq!(result.as_deref(), Ok("compressed"));
    }

    #[tokio::test]
    async fn rate_limit_retries_exactly_once() {
        let attempts = Cell::new(0_u32);
        let result = compress_with_sender(
            || {
                attempts.set(attempts.get() + 1);
                let attempt = attempts.get();
                async move {
                    if attempt == 1 {
                        Ok((429, String::new()))
                    } else {
                        Ok((200, success_body("after retry")))
                    }
                }
            },
            async {},
        )
        .await;
        assert_eq!(result.as_deref(), Ok("after retry"));
        assert_eq!(attempts.get(), 2);
    }

    #[tokio::test]
    async fn second_rate_limit_stops_without_a_third_attempt() {
        let attempts = Cell::new(0_u32);
        let result = compress_with_sender(
            || {
                attempts.set(attempts.get() + 1);
                async { Ok((429, String::new())) }
            },
            async {},
        )
        .await;
        assert_eq!(result.expect_err("should fail"), RATE_LIMIT_MESSAGE);
        assert_eq!(attempts.get(), 2);
    }

    #[tokio::test]
    async fn unauthorized_surfaces_body_message() {
        let body = serde_json::json!({"error": {"message": "bad key"}}).to_string();
        let result = compress_with_sender(
            || {
                let body = body.clone();
                async move { Ok((401, body)) }
            },
            async {},
        )
        .await;
        assert_eq!(result.expect_err("should fail"), "bad key");
    }

    #[tokio::test]
    async fn unauthorized_without_body_gets_key_hint() {
        let result = compress_with_sender(|| async { Ok((403, String::new())) }, async {}).await;
        assert_eq!(result.expect_err("should fail"), INVALID_KEY_MESSAGE);
    }

    #[tokio::test]
    async fn server_error_maps_to_generic_message() {
        let result = compress_with_sender(|| async { Ok((500, String::new())) }, async {}).await;
        assert_eq!(result.expect_err("should fail"), "API error: 500");
    }

    #[tokio::test]
    async fn empty_choices_are_an_unexpected_format() {
        let body = serde_json::json!({"choices": []}).to_string();
        let result = compress_with_sender(
            || {
                let body = body.clone();
                async move { Ok((200, body)) }
            },
            async {},
        )
        .await;
        assert_eq!(
            result.expect_err("should fail"),
            UNEXPECTED_RESPONSE_MESSAGE
        );
    }

    #[test]
    fn fallback_keeps_the_raw_transcript() {
        let document = fallback_handoff(&[message("user", "save this")], "boom");
        assert!(document.contains("Compression failed"));
        assert!(document.contains("**Error:** boom"));
        assert!(document.contains("User: save this"));
    }
}
