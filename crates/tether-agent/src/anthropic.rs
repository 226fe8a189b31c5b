use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::{ChatProvider, ChatRequest, ProviderError, ToolChoice};
use crate::sse::{self, SseEvent};

const API_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat01-";

/// HTTP client for the streaming Messages endpoint.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    is_oauth: bool,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let is_oauth = api_key.starts_with(OAUTH_TOKEN_PREFIX);
        Self {
            client: reqwest::Client::new(),
            is_oauth,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }

    /// Apply auth headers — OAuth tokens use Bearer + beta header,
    /// regular API keys use x-api-key.
    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.is_oauth {
            builder
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("anthropic-beta", OAUTH_BETA)
        } else {
            builder.header("x-api-key", &self.api_key)
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<SseEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %req.model, "sending streaming request");

        let builder = self
            .client
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body);

        let resp = self.apply_auth(builder).send().await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "streaming API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        sse::decode_stream(resp, tx, cancel).await;
        Ok(())
    }
}

/// Serialize the outgoing payload. Only role and content go on the wire —
/// the synthetic placeholder tag stays local.
pub fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
        "system": req.system,
        "messages": messages,
        "stream": req.stream,
    });

    if !req.tools.is_empty() {
        body["tools"] = serde_json::json!(req.tools);
        match &req.tool_choice {
            // Auto is the server default; omit it entirely.
            ToolChoice::Auto => {}
            ToolChoice::Any => {
                body["tool_choice"] = serde_json::json!({ "type": "any" });
            }
            ToolChoice::Named(name) => {
                body["tool_choice"] = serde_json::json!({ "type": "tool", "name": name });
            }
        }
    }

    if let Some(budget) = req.thinking_budget {
        body["thinking"] = serde_json::json!({
            "type": "enabled",
            "budget_tokens": budget,
        });
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ContentBlock, Message};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "claude-sonnet-4-6".to_string(),
            max_tokens: 8_000,
            temperature: 0.2,
            thinking_budget: None,
            system: vec![ContentBlock::text("You are terse.")],
            messages: vec![Message::user_text("hi")],
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            stream: true,
        }
    }

    #[test]
    fn body_carries_core_fields() {
        let body = build_request_body(&request());
        assert_eq!(body["model"], "claude-sonnet-4-6");
        assert_eq!(body["max_tokens"], 8_000);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert!(body.get("tools").is_none());
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn synthetic_tag_never_reaches_the_wire() {
        let mut req = request();
        req.messages = vec![tether_core::Message::placeholder_user_text()];
        let body = build_request_body(&req);
        assert!(body["messages"][0].get("synthetic").is_none());
    }

    #[test]
    fn named_tool_choice_includes_name() {
        let mut req = request();
        req.tools = vec![crate::provider::ToolDefinition {
            name: "demo".to_string(),
            description: "demo tool".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
            cache_control: None,
        }];
        req.tool_choice = ToolChoice::Named("demo".to_string());
        let body = build_request_body(&req);
        assert_eq!(body["tool_choice"]["type"], "tool");
        assert_eq!(body["tool_choice"]["name"], "demo");
    }

    #[test]
    fn auto_tool_choice_is_omitted() {
        let mut req = request();
        req.tools = vec![crate::provider::ToolDefinition {
            name: "demo".to_string(),
            description: "demo tool".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
            cache_control: None,
        }];
        let body = build_request_body(&req);
        assert!(body.get("tool_choice").is_none());
        assert_eq!(body["tools"][0]["name"], "demo");
    }

    #[test]
    fn thinking_budget_serialized_when_set() {
        let mut req = request();
        req.thinking_budget = Some(15_000);
        let body = build_request_body(&req);
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 15_000);
    }
}
