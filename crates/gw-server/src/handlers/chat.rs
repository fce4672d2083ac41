//! `chat.send` and `chat.stream`: delegate a user message to the agent.
//!
//! Every run is bound to the client's lifetime and to [`AGENT_TIMEOUT`].
//! The streaming variant relays deltas and tool notices as `chat.delta` /
//! `chat.tool` events to the requesting client, numbered from 1, before
//! the final response.

use crate::collab::{AgentRunner, InboundMessage, RunResult, StreamCallback, StreamEvent, Usage};
use crate::rpc::{HandlerFuture, RequestContext};
use gw_core::{codes, ErrorShape, GwResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on a single agent run.
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Stream events buffered per call while the client catches up. Events
/// beyond this are dropped; the final response still carries the full text.
pub const STREAM_BUFFER: usize = 256;

pub const DELTA_EVENT: &str = "chat.delta";
pub const TOOL_EVENT: &str = "chat.tool";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatParams {
    #[serde(default)]
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatReply {
    response: String,
    session_id: String,
    model: String,
    usage: Usage,
    cost: f64,
    duration_ms: u64,
}

impl ChatReply {
    fn new(result: RunResult, response: String) -> Self {
        Self {
            response,
            session_id: result.session_id,
            model: result.model,
            usage: result.usage,
            cost: result.cost,
            duration_ms: result.duration.as_millis() as u64,
        }
    }
}

/// Validate params and look up the runner. `None` means an error response
/// was already sent.
async fn prepare(
    ctx: &RequestContext,
) -> GwResult<Option<(Arc<dyn AgentRunner>, InboundMessage)>> {
    let Some(params) = ctx.params_or_reject::<ChatParams>().await? else {
        return Ok(None);
    };
    if params.message.trim().is_empty() {
        ctx.respond_error(codes::INVALID_PARAMS, "message is required")
            .await?;
        return Ok(None);
    }
    let Some(runner) = ctx.server.collaborators().runner.clone() else {
        ctx.respond_error(codes::UNAVAILABLE, "agent runner not configured")
            .await?;
        return Ok(None);
    };
    let message = InboundMessage {
        channel: "gateway".into(),
        chat_id: ctx.client.id.clone(),
        sender_id: ctx.client.info.id.clone(),
        text: params.message,
        session_id: params.session_id,
    };
    Ok(Some((runner, message)))
}

async fn agent_failed(ctx: &RequestContext, message: String) -> GwResult<()> {
    warn!(conn_id = %ctx.client.id, id = %ctx.id(), method = %ctx.request.method, error = %message, "agent run failed");
    ctx.respond_error(codes::AGENT_ERROR, message).await
}

async fn agent_timed_out(ctx: &RequestContext) -> GwResult<()> {
    warn!(conn_id = %ctx.client.id, id = %ctx.id(), method = %ctx.request.method, "agent run timed out");
    ctx.respond_shape(ErrorShape::new(codes::AGENT_ERROR, "agent timed out").retry_after(None))
        .await
}

pub fn send(ctx: &RequestContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Some((runner, message)) = prepare(ctx).await? else {
            return Ok(());
        };
        let cancel = ctx.client.closed_token();
        let outcome = tokio::time::timeout(AGENT_TIMEOUT, runner.run(cancel.clone(), message)).await;
        match outcome {
            Ok(Ok(result)) => {
                let response = result.response.clone();
                ctx.respond(&ChatReply::new(result, response)).await
            }
            Ok(Err(e)) => agent_failed(ctx, format!("{e:#}")).await,
            Err(_) => {
                cancel.cancel();
                agent_timed_out(ctx).await
            }
        }
    })
}

/// Per-call relay state for a streaming run.
struct Relay {
    seq: u64,
    text: String,
    stream_error: Option<String>,
    /// Cancels the run once the client stops accepting events.
    cancel: CancellationToken,
}

impl Relay {
    async fn forward(&mut self, ctx: &RequestContext, event: StreamEvent) {
        let (name, payload) = match event {
            StreamEvent::Delta(delta) => {
                self.text.push_str(&delta);
                (DELTA_EVENT, json!({ "delta": delta }))
            }
            StreamEvent::ToolStart { name, input } => {
                (TOOL_EVENT, json!({ "phase": "start", "name": name, "input": input }))
            }
            StreamEvent::ToolResult { name, output } => {
                (TOOL_EVENT, json!({ "phase": "result", "name": name, "output": output }))
            }
            StreamEvent::ToolError { name, error } => {
                (TOOL_EVENT, json!({ "phase": "error", "name": name, "error": error }))
            }
            StreamEvent::Error(message) => {
                self.stream_error = Some(message);
                return;
            }
            StreamEvent::Done => return,
        };
        self.seq += 1;
        if let Err(e) = ctx.emit(name, &payload, self.seq).await {
            if !self.cancel.is_cancelled() {
                debug!(conn_id = %ctx.client.id, error = %e, "client gone, cancelling agent run");
                self.cancel.cancel();
            }
        }
    }
}

pub fn stream(ctx: &RequestContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Some((runner, message)) = prepare(ctx).await? else {
            return Ok(());
        };
        let cancel = ctx.client.closed_token();
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_BUFFER);
        let dropped = Arc::new(AtomicUsize::new(0));
        let on_event: StreamCallback = {
            let dropped = dropped.clone();
            let conn_id = ctx.client.id.clone();
            Arc::new(move |event| {
                if let Err(TrySendError::Full(_)) = tx.try_send(event) {
                    if dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                        warn!(conn_id = %conn_id, "stream buffer full, dropping agent events");
                    }
                }
            })
        };

        let mut run = runner.run_stream(cancel.clone(), message, on_event);
        let deadline = tokio::time::sleep(AGENT_TIMEOUT);
        tokio::pin!(deadline);

        let mut relay = Relay {
            seq: 0,
            text: String::new(),
            stream_error: None,
            cancel: cancel.clone(),
        };
        let outcome = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => relay.forward(ctx, event).await,
                result = &mut run => break Some(result),
                _ = &mut deadline => break None,
            }
        };
        drop(run);
        // Events emitted right before the run finished.
        while let Ok(event) = rx.try_recv() {
            relay.forward(ctx, event).await;
        }

        match outcome {
            Some(Ok(result)) => {
                if let Some(error) = &relay.stream_error {
                    warn!(conn_id = %ctx.client.id, error = %error, "agent reported a stream error");
                }
                let lossy = dropped.load(Ordering::Relaxed) > 0;
                let response = if relay.text.is_empty() || (lossy && !result.response.is_empty()) {
                    result.response.clone()
                } else {
                    std::mem::take(&mut relay.text)
                };
                ctx.respond(&ChatReply::new(result, response)).await
            }
            Some(Err(e)) => {
                let message = match relay.stream_error {
                    Some(reported) => format!("{e:#}: {reported}"),
                    None => format!("{e:#}"),
                };
                agent_failed(ctx, message).await
            }
            None => {
                cancel.cancel();
                agent_timed_out(ctx).await
            }
        }
    })
}
