use serde::{Deserialize, Serialize};

/// Placeholder messages are detected by this prefix. Kept byte-for-byte
/// compatible with histories persisted by earlier versions; new placeholders
/// additionally carry [`Message::synthetic`] so the hot path can skip the
/// string test.
pub const PLACEHOLDER_PREFIX: &str = "placeholder for missing";
pub const PLACEHOLDER_USER_TEXT: &str = "placeholder for missing user text message";
pub const PLACEHOLDER_USER_TOOL_RESULT: &str = "placeholder for missing user tool result message";
pub const PLACEHOLDER_ASSISTANT: &str = "placeholder for missing assistant message";

/// Body of the keep-alive ping sent to refresh the server-side prompt cache.
pub const KEEP_ALIVE_PROMPT: &str =
    "This is a 'ping' to reset cache ttl, respond with 'ping ack'";
/// A user message whose first text block contains this substring is treated
/// as a keep-alive turn and excluded from the persistent store.
pub const KEEP_ALIVE_MARKER: &str = "This is a 'ping'";

/// Synthesized assistant text when a turn contains only tool-use blocks —
/// role alternation requires the committed text portion to be non-empty.
pub const TOOL_CALLED_TEXT: &str = "[Tool called]";
/// Synthesized leading text when a tool-result block would otherwise open
/// a user message.
pub const TOOL_RESULT_LEAD: &str = "[Tool result]";
/// Appended to the last text block of a turn that was cancelled mid-stream.
pub const GENERATION_STOPPED_MARKER: &str = "[generation stopped]";
/// Appended to text bodies shortened on load from the persistent store.
pub const TRUNCATION_SUFFIX: &str = "[truncated]";

/// Format the notice prepended to outgoing user text while buffered tool
/// calls are still executing.
pub fn pending_tool_notice(names: &[String]) -> String {
    format!(
        "[NOTE: Tool(s) '{}' are still processing.]\n\n",
        names.join(", ")
    )
}

#[derive(Serialize)]
struct PermissionDeniedPayload {
    error: String,
    status: &'static str,
    message: &'static str,
}

/// Pretty-printed JSON document returned as the tool result of a disallowed
/// tool invocation.
pub fn permission_denied_payload(tool: &str) -> String {
    let payload = PermissionDeniedPayload {
        error: format!(
            "Tool '{tool}' is not allowed in the current context. \
             Review the chain of thought, rules, and guidelines."
        ),
        status: "error",
        message: "Stop, inform the user of the error. Do NOT proceed!",
    };
    // Struct serialization cannot fail.
    serde_json::to_string_pretty(&payload).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Server-side prompt cache TTL hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTtl {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

/// Cache marker placed on a content block. The server treats the prefix up
/// to and including the marked block as a cacheable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: CacheKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<CacheTtl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Ephemeral,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: CacheKind::Ephemeral,
            ttl: None,
        }
    }

    pub fn with_ttl(ttl: CacheTtl) -> Self {
        Self {
            kind: CacheKind::Ephemeral,
            ttl: Some(ttl),
        }
    }
}

/// Base64 image payload (user input only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// One typed fragment of a message, wire-compatible with the Messages API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    /// Verbatim rationale chunk; the signature authenticates it on resend.
    Thinking { thinking: String, signature: String },
    /// Server-obfuscated rationale.
    RedactedThinking { data: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ContentBlock {
    pub fn text(body: impl Into<String>) -> Self {
        ContentBlock::Text {
            text: body.into(),
            cache_control: None,
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            cache_control: None,
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: Vec<ContentBlock>,
        is_error: bool,
    ) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error,
            cache_control: None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ContentBlock::Text { .. })
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }

    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            ContentBlock::ToolUse { id, .. } => Some(id),
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id),
            _ => None,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            ContentBlock::ToolUse { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Cut an oversized text body to `max_chars`, appending the truncation
    /// suffix. Recurses into tool-result content.
    pub fn truncate_text(&mut self, max_chars: usize) {
        match self {
            ContentBlock::Text { text, .. } => {
                if text.chars().count() > max_chars {
                    let cut: String = text.chars().take(max_chars).collect();
                    *text = format!("{cut}{TRUNCATION_SUFFIX}");
                }
            }
            ContentBlock::ToolResult { content, .. } => {
                for nested in content {
                    nested.truncate_text(max_chars);
                }
            }
            _ => {}
        }
    }

    /// Mutable access to the cache-marker slot, `None` for kinds that cannot
    /// carry one (thinking blocks).
    pub fn cache_slot_mut(&mut self) -> Option<&mut Option<CacheControl>> {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::Image { cache_control, .. }
            | ContentBlock::ToolUse { cache_control, .. }
            | ContentBlock::ToolResult { cache_control, .. } => Some(cache_control),
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => None,
        }
    }
}

/// A role paired with a non-empty ordered list of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Marks messages the normalizer or orchestrator fabricated to keep the
    /// history well-formed. Never sent on the wire — the request builder
    /// serializes role and content only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub synthetic: bool,
}

impl Message {
    /// Build a message, synthesizing a leading text block when the first
    /// block would otherwise be a `tool_use` or `tool_result`.
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        let mut msg = Self {
            role,
            content,
            synthetic: false,
        };
        msg.ensure_leading_text();
        msg
    }

    /// Enforce the leading-block invariant on content that was assembled or
    /// loaded elsewhere: a `tool_use`/`tool_result` block never opens a
    /// message.
    pub fn ensure_leading_text(&mut self) {
        match self.content.first() {
            Some(ContentBlock::ToolUse { .. }) => {
                self.content.insert(0, ContentBlock::text(TOOL_CALLED_TEXT));
            }
            Some(ContentBlock::ToolResult { .. }) => {
                self.content.insert(0, ContentBlock::text(TOOL_RESULT_LEAD));
            }
            _ => {}
        }
    }

    pub fn user_text(body: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(body)])
    }

    pub fn assistant_text(body: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(body)])
    }

    pub fn placeholder_user_text() -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(PLACEHOLDER_USER_TEXT)],
            synthetic: true,
        }
    }

    pub fn placeholder_assistant() -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(PLACEHOLDER_ASSISTANT)],
            synthetic: true,
        }
    }

    /// Placeholder user reply answering a dangling `tool_use`.
    pub fn placeholder_tool_result(tool_use_id: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![
                ContentBlock::text(PLACEHOLDER_USER_TOOL_RESULT),
                ContentBlock::tool_result(
                    tool_use_id,
                    vec![ContentBlock::text(PLACEHOLDER_USER_TOOL_RESULT)],
                    false,
                ),
            ],
            synthetic: true,
        }
    }

    /// Placeholder detection: the synthetic tag, or the legacy sentinel
    /// prefix on the first text block.
    pub fn is_placeholder(&self) -> bool {
        if self.synthetic {
            return true;
        }
        matches!(
            self.content.first(),
            Some(ContentBlock::Text { text, .. }) if text.starts_with(PLACEHOLDER_PREFIX)
        )
    }

    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|b| b.as_text())
    }

    /// Ids of every `tool_use` block in this message, in order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter(|b| b.is_tool_use())
            .filter_map(|b| b.tool_use_id())
            .collect()
    }

    /// Ids of every `tool_result` block in this message, in order.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter(|b| b.is_tool_result())
            .filter_map(|b| b.tool_use_id())
            .collect()
    }

    /// Id of the trailing `tool_use` block, if the message ends with one.
    pub fn trailing_tool_use(&self) -> Option<&str> {
        match self.content.last() {
            Some(ContentBlock::ToolUse { id, .. }) => Some(id),
            _ => None,
        }
    }

    /// Whether this is a keep-alive turn (either direction).
    pub fn is_keep_alive(&self) -> bool {
        self.first_text()
            .is_some_and(|t| t.contains(KEEP_ALIVE_MARKER))
    }
}
