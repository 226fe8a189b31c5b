use tether_core::{CacheControl, ContentBlock, Message, Role, TetherError};

use crate::provider::{ChatRequest, RequestParams, ToolChoice, ToolDefinition};

/// Output ceiling for the sonnet generation-4 family.
const SONNET4_MAX_TOKENS: u32 = 10_000;
/// Thinking budget for the sonnet generation-4 family — must stay below its
/// output ceiling.
const SONNET4_THINKING_BUDGET: u32 = 5_000;
/// Output ceiling whenever extended thinking is on for other models.
const THINKING_MAX_TOKENS: u32 = 25_000;
const THINKING_BUDGET: u32 = 15_000;
const DEFAULT_MAX_TOKENS: u32 = 8_000;

const THINKING_TEMPERATURE: f32 = 1.0;
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Assemble the outgoing request: apply the cache-marking policy, trim the
/// tail so the request ends on a user turn, and pick per-model limits.
pub fn build_request(
    history: &[Message],
    system: &[ContentBlock],
    tools: &[ToolDefinition],
    params: &RequestParams,
) -> Result<ChatRequest, TetherError> {
    if let ToolChoice::Named(name) = &params.tool_choice {
        if name.trim().is_empty() {
            return Err(TetherError::Validation(
                "tool_choice 'named' requires a tool name".to_string(),
            ));
        }
    }

    let mut messages: Vec<Message> = history.to_vec();
    // The request must end with a user turn.
    while messages.last().is_some_and(|m| m.role != Role::User) {
        messages.pop();
    }
    if messages.is_empty() {
        return Err(TetherError::Validation(
            "history holds no user message to send".to_string(),
        ));
    }

    let mut system = system.to_vec();
    let mut tools = tools.to_vec();
    if params.use_cache {
        apply_cache_policy(&mut messages, &mut system, &mut tools, params);
    }

    let (max_tokens, temperature, thinking_budget) = model_limits(params);

    Ok(ChatRequest {
        model: params.model.clone(),
        max_tokens,
        temperature,
        thinking_budget,
        system,
        messages,
        tools,
        tool_choice: params.tool_choice.clone(),
        stream: true,
    })
}

/// Cache-marking policy: at most one tool, one system block, and two
/// user-message breakpoints carry an ephemeral marker.
fn apply_cache_policy(
    messages: &mut [Message],
    system: &mut [ContentBlock],
    tools: &mut [ToolDefinition],
    params: &RequestParams,
) {
    if params.cache_tools {
        if let Some(last) = tools.last_mut() {
            last.cache_control = Some(CacheControl::ephemeral());
        }
    }

    if params.cache_system {
        if let Some(slot) = system.last_mut().and_then(ContentBlock::cache_slot_mut) {
            *slot = Some(CacheControl::ephemeral());
        }
    }

    if params.cache_messages {
        let user_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::User)
            .map(|(i, _)| i)
            .collect();
        let breakpoints: &[usize] = match user_indices.len() {
            0 => &[],
            n => &user_indices[n.saturating_sub(2)..],
        };

        for (i, msg) in messages.iter_mut().enumerate() {
            if msg.role != Role::User {
                continue;
            }
            // Clear stale markers everywhere first so at most two survive.
            for block in &mut msg.content {
                if let Some(slot) = block.cache_slot_mut() {
                    *slot = None;
                }
            }
            if breakpoints.contains(&i) {
                if let Some(block) = msg
                    .content
                    .iter_mut()
                    .find(|b| b.is_text() || b.is_tool_result())
                {
                    if let Some(slot) = block.cache_slot_mut() {
                        *slot = Some(CacheControl::ephemeral());
                    }
                }
            }
        }
    }
}

/// Per-model parameter table.
fn model_limits(params: &RequestParams) -> (u32, f32, Option<u32>) {
    if params.model.contains("sonnet-4") {
        let thinking = params.use_thinking.then_some(SONNET4_THINKING_BUDGET);
        let temperature = if thinking.is_some() {
            THINKING_TEMPERATURE
        } else {
            DEFAULT_TEMPERATURE
        };
        (SONNET4_MAX_TOKENS, temperature, thinking)
    } else if params.use_thinking {
        (THINKING_MAX_TOKENS, THINKING_TEMPERATURE, Some(THINKING_BUDGET))
    } else {
        (DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, None)
    }
}
