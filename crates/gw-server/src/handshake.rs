//! Connection handshake.
//!
//! 1. Server sends a `connect.challenge` event with a random nonce
//! 2. Client sends a `connect` request (protocol range, identity, credentials)
//! 3. Server answers with HelloOK, or an error response and closes

use crate::auth::{authorize, AuthResult, ResolvedAuth};
use crate::client::Connection;
use gw_core::messages::{Features, Policy, ServerInfo};
use gw_core::{
    codes, Challenge, ConnectParams, ErrorShape, Frame, GwError, GwResult, HelloOk,
    RequestFrame, CHALLENGE_EVENT, CONNECT_METHOD, PROTOCOL_VERSION,
};
use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// How long a fresh socket may take to send a valid `connect`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound frame, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

/// Outbound buffering limit advertised to clients.
pub const MAX_BUFFERED_BYTES: usize = 1536 * 1024;

/// Interval between `tick` events.
pub const TICK_INTERVAL_MS: u64 = 30_000;

/// Events the server may push after the handshake.
pub const SERVER_EVENTS: &[&str] = &[
    CHALLENGE_EVENT,
    "chat.delta",
    "chat.tool",
    "tick",
    "shutdown",
];

/// A client that passed the handshake.
#[derive(Debug)]
pub struct Admitted {
    /// Id of the `connect` request, echoed by HelloOK.
    pub request_id: String,
    pub params: ConnectParams,
    pub auth: AuthResult,
}

/// A handshake failure, answered with an error response before closing.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub id: String,
    pub code: &'static str,
    pub message: String,
}

impl Rejection {
    fn new(id: &str, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            code,
            message: message.into(),
        }
    }

    fn into_frame(self) -> Frame {
        Frame::error(self.id, ErrorShape::new(self.code, self.message))
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Build the challenge event with a fresh 32-byte nonce.
pub fn build_challenge() -> GwResult<Frame> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill(&mut nonce[..]);
    let challenge = Challenge {
        nonce: hex::encode(nonce),
        ts: unix_millis(),
    };
    Frame::event(CHALLENGE_EVENT, &challenge, 0)
}

/// Check that the first frame is a well-formed `connect` request the server
/// can speak.
pub fn validate_connect(frame: Frame) -> Result<(String, ConnectParams), Rejection> {
    let request: RequestFrame = match frame {
        Frame::Request(req) => req,
        other => {
            return Err(Rejection::new(
                "",
                codes::PROTOCOL_ERROR,
                format!("expected connect request, got {}", other.kind()),
            ))
        }
    };
    if request.method != CONNECT_METHOD {
        return Err(Rejection::new(
            &request.id,
            codes::PROTOCOL_ERROR,
            format!("first request must be connect, got {}", request.method),
        ));
    }
    let params = match request.decode_params::<ConnectParams>() {
        Ok(Some(params)) => params,
        Ok(None) => {
            return Err(Rejection::new(
                &request.id,
                codes::INVALID_PARAMS,
                "missing connect params",
            ))
        }
        Err(e) => {
            return Err(Rejection::new(
                &request.id,
                codes::INVALID_PARAMS,
                format!("invalid connect params: {e}"),
            ))
        }
    };
    if !params.supports(PROTOCOL_VERSION) {
        return Err(Rejection::new(
            &request.id,
            codes::PROTOCOL_ERROR,
            format!(
                "unsupported protocol range {}..={} (server speaks {})",
                params.min_protocol, params.max_protocol, PROTOCOL_VERSION
            ),
        ));
    }
    Ok((request.id, params))
}

/// Run the server side of the handshake on a fresh connection.
///
/// On `Err` the caller records a rate-limit failure and closes the
/// connection; any error response has already been sent.
pub async fn perform(conn: &Connection, server_auth: &ResolvedAuth, remote: &str) -> GwResult<Admitted> {
    conn.send(&build_challenge()?).await?;

    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.read_frame()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return Err(GwError::Closed),
        Ok(Err(GwError::Codec(e))) => {
            let rejection = Rejection::new("", codes::PROTOCOL_ERROR, format!("malformed frame: {e}"));
            return reject(conn, rejection).await;
        }
        Ok(Err(GwError::BadRequest { id, reason })) => {
            let rejection = Rejection::new(&id, codes::PROTOCOL_ERROR, format!("malformed frame: {reason}"));
            return reject(conn, rejection).await;
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!(remote, "no connect request before deadline");
            return Err(GwError::Timeout);
        }
    };

    let (request_id, params) = match validate_connect(first) {
        Ok(valid) => valid,
        Err(rejection) => return reject(conn, rejection).await,
    };

    let auth = authorize(server_auth, params.auth.as_ref());
    if !auth.ok {
        warn!(remote, client_id = %params.client.id, reason = auth.reason(), "handshake rejected");
        let reason = auth.reason().to_string();
        let rejection = Rejection::new(&request_id, codes::UNAUTHORIZED, reason.clone());
        conn.send(&rejection.into_frame()).await?;
        return Err(GwError::AuthFailed(reason));
    }

    info!(remote, client_id = %params.client.id, method = ?auth.method, "handshake accepted");
    Ok(Admitted {
        request_id,
        params,
        auth,
    })
}

async fn reject<T>(conn: &Connection, rejection: Rejection) -> GwResult<T> {
    warn!(code = rejection.code, message = %rejection.message, "handshake rejected");
    let message = rejection.message.clone();
    conn.send(&rejection.into_frame()).await?;
    Err(GwError::InvalidMessage(message))
}

/// Build the HelloOK response for an admitted client.
pub fn build_hello(
    request_id: &str,
    conn_id: &str,
    methods: Vec<String>,
    commit: Option<String>,
) -> GwResult<Frame> {
    let hello = HelloOk {
        kind: "hello-ok".into(),
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").into(),
            commit,
            conn_id: conn_id.into(),
        },
        features: Features {
            methods,
            events: SERVER_EVENTS.iter().map(|e| e.to_string()).collect(),
        },
        policy: Policy {
            max_payload: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
        },
    };
    Frame::ok(request_id, &hello)
}
