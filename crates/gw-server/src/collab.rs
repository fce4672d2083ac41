//! Interfaces of the components the gateway delegates to but does not own:
//! the conversational agent, the messaging-channel registry, and the
//! lifecycle hook manager.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A user message handed to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Originating channel; always `"gateway"` for socket clients.
    pub channel: String,
    /// Conversation identifier within the channel (the connection id).
    pub chat_id: String,
    /// Declared client id of the sender.
    pub sender_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Token accounting reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Final outcome of one agent run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    pub response: String,
    pub session_id: String,
    pub model: String,
    pub usage: Usage,
    pub cost: f64,
    pub duration: Duration,
}

/// Incremental notice emitted during a streaming run.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    ToolStart { name: String, input: Value },
    ToolResult { name: String, output: String },
    ToolError { name: String, error: String },
    Done,
    Error(String),
}

/// Callback the agent invokes for every [`StreamEvent`], in order.
pub type StreamCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Turns a user message into a reply.
///
/// Implementations should stop work promptly once `cancel` fires.
pub trait AgentRunner: Send + Sync {
    fn run(
        &self,
        cancel: CancellationToken,
        message: InboundMessage,
    ) -> BoxFuture<'_, anyhow::Result<RunResult>>;

    fn run_stream(
        &self,
        cancel: CancellationToken,
        message: InboundMessage,
        on_event: StreamCallback,
    ) -> BoxFuture<'_, anyhow::Result<RunResult>>;
}

/// Status of one messaging channel adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub channel_id: String,
    pub connected: bool,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Registry of messaging channel adapters.
pub trait ChannelRegistry: Send + Sync {
    fn status(&self) -> Vec<ChannelStatus>;
}

/// Fire-and-forget lifecycle notifications.
pub trait HookManager: Send + Sync {
    fn emit(&self, event: &str, data: Value) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// The optional collaborators wired into a server.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub runner: Option<Arc<dyn AgentRunner>>,
    pub channels: Option<Arc<dyn ChannelRegistry>>,
    pub hooks: Option<Arc<dyn HookManager>>,
}
