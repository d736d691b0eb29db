//! Wire types for the app-builder runtime.
//!
//! Three small vocabularies live here:
//!
//! - [`ClientMessage`] — what a client sends over the chat channel.
//! - [`Envelope`] — what the server streams back. One envelope per message,
//!   tagged by `type`, with the exact field names the frontend consumes.
//! - [`ModelEvent`] / [`ModelInput`] — the newline-delimited JSON protocol
//!   spoken with the reasoning-model subprocess. The runtime never depends on
//!   the model's internal wire format beyond these shapes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message received from the client on the chat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A user turn for the agent.
    Chat { message: String },
    /// Keepalive; answered with [`Envelope::Pong`].
    Ping,
    /// Tear down and rebuild the agent and workspace.
    Reset,
}

/// One tagged message on the server → client stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First envelope on a channel; confirms the session binding.
    Connection {
        session_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        reconnected: bool,
    },
    /// Assistant text delta.
    Text { content: String },
    /// A tool invocation the agent is about to perform.
    ToolUse {
        tool: String,
        input: Value,
        id: String,
    },
    /// Outcome of a tool invocation, keyed by the originating call id.
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    /// Terminal envelope of a successful turn.
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        preview_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_turns: Option<u32>,
    },
    /// Terminal envelope of a failed turn, or a standalone failure notice.
    Error { message: String },
    Pong,
}

impl Envelope {
    /// True for the envelopes that end a turn stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Envelope::Done { .. } | Envelope::Error { .. })
    }
}

/// A typed message emitted by the reasoning-model subprocess, one JSON object
/// per line on its stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    /// Assistant text block.
    Text { content: String },
    /// Request to invoke a named tool. The runtime gates, executes, and
    /// answers with [`ModelInput::ToolResult`].
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// A tool result the model produced itself (internal tools); passed
    /// through to the client unchanged.
    ToolResult {
        id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Terminal summary for the current query.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_turns: Option<u32>,
        #[serde(default)]
        is_error: bool,
    },
}

/// A message written to the reasoning-model subprocess, one JSON object per
/// line on its stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelInput {
    /// A user turn.
    User { content: String },
    /// Answer to a [`ModelEvent::ToolUse`] request.
    ToolResult {
        id: String,
        content: Value,
        is_error: bool,
    },
    /// Synthetic system message injected by a post-tool hook; consumed by the
    /// model as steering context for its next step.
    System { content: String },
}
