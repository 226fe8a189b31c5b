//! `tether-core` — shared data model, configuration, and errors.
//!
//! # Overview
//!
//! Every other crate in the workspace builds on the types here: the
//! [`content::ContentBlock`] tagged enum and [`content::Message`] wrapper
//! that model one conversation turn, the bit-exact protocol strings
//! (keep-alive prompt, placeholder bodies, pending-tool notice), the
//! [`config::TetherConfig`] loader, and the top-level [`error::TetherError`].

pub mod config;
pub mod content;
pub mod error;

pub use config::TetherConfig;
pub use content::{
    pending_tool_notice, permission_denied_payload, CacheControl, CacheTtl, ContentBlock,
    GENERATION_STOPPED_MARKER, ImageSource, KEEP_ALIVE_MARKER, KEEP_ALIVE_PROMPT, Message,
    PLACEHOLDER_ASSISTANT, PLACEHOLDER_PREFIX, PLACEHOLDER_USER_TEXT,
    PLACEHOLDER_USER_TOOL_RESULT, Role, TOOL_CALLED_TEXT, TOOL_RESULT_LEAD, TRUNCATION_SUFFIX,
};
pub use error::{Result, TetherError};
