//! The tool bridge: per-conversation state that parks MCP tool calls until
//! Xcode delivers their results, plus the HTTP endpoints the MCP shim (or
//! the session library directly) talks to.

pub mod conversation;
pub mod manager;
pub mod routes;
pub mod tool_cache;

pub use conversation::{BridgeError, ConversationState};
pub use manager::{Conversation, ConversationManager};
pub use tool_cache::{ToolCache, ToolDefinition};
