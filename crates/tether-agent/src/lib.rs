//! `tether-agent` — the conversation orchestrator and its streaming
//! plumbing.
//!
//! # Overview
//!
//! One [`orchestrator::Orchestrator`] owns the conversation: it drives a
//! single in-flight streaming request at a time, splits assistant turns
//! that contain tool calls, parks the tool-use half in the pair buffer
//! while handlers run, and sends buffered tool results back through the
//! same path once they land. A keep-alive timer refreshes the server-side
//! prompt cache between user turns.
//!
//! Module map:
//!
//! | Module | Role |
//! |--------|------|
//! | [`sse`] | frame the SSE byte stream into typed events |
//! | [`assembler`] | collapse events into one completed assistant turn |
//! | [`provider`] / [`anthropic`] | transport seam and the HTTP client |
//! | [`builder`] | cache marking, tail trim, per-model parameters |
//! | [`gate`] | tool-chain permission policy |
//! | [`tools`] | the `Tool` trait handlers implement |
//! | [`events`] | ordered event bus consumed by the front-end |
//! | [`orchestrator`] | ties all of the above together |

pub mod anthropic;
pub mod assembler;
pub mod builder;
pub mod events;
pub mod gate;
pub mod orchestrator;
pub mod provider;
pub mod sse;
pub mod tools;

pub use anthropic::AnthropicProvider;
pub use assembler::{AssistantTurn, StopReason, TurnAssembler};
pub use events::{BusEvent, BusSender};
pub use gate::{PermissionGate, ToolRule};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use provider::{ChatProvider, ChatRequest, ProviderError, RequestParams, ToolChoice, ToolDefinition};
pub use sse::{Delta, SseDecoder, SseEvent, StartedBlock, Usage};
pub use tools::{Tool, ToolOutput};
