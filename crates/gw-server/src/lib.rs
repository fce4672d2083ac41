//! gw-server: the assistant gateway.
//!
//! Accepts WebSocket connections, authenticates them with a
//! challenge/connect handshake, and serves request/response/event frames
//! through a fixed method table. Agent runs, channel status and lifecycle
//! hooks are delegated to [`collab`] implementations supplied by the host.

pub mod auth;
pub mod client;
pub mod collab;
pub mod config;
pub mod handlers;
pub mod handshake;
pub mod http;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod tls;

pub use collab::{
    AgentRunner, ChannelRegistry, ChannelStatus, Collaborators, HookManager, InboundMessage,
    RunResult, StreamCallback, StreamEvent, Usage,
};
pub use config::{BindMode, CliOverrides, ServerConfig};
pub use server::GatewayServer;
