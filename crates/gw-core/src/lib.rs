//! gw-core: Shared protocol library for the assistant gateway.
//!
//! Provides the request/response/event frame envelope, its JSON codec,
//! the handshake payload types, error codes, and constant-time secret
//! comparison used by the authorizer.

pub mod codec;
pub mod error;
pub mod frame;
pub mod messages;
pub mod secret;

// Re-export commonly used items at crate root.
pub use codec::{frame_decode, frame_encode};
pub use error::{GwError, GwResult};
pub use frame::{codes, ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame};
pub use messages::{
    Challenge, ClientInfo, ConnectAuth, ConnectParams, Features, HelloOk, Policy, ServerInfo,
    CHALLENGE_EVENT, CONNECT_METHOD, PROTOCOL_VERSION,
};
pub use secret::constant_time_eq;
