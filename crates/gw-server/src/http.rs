//! HTTP surface: the public health probe, the WebSocket upgrade endpoint
//! and the middleware stack around both.

use crate::handshake::MAX_PAYLOAD_BYTES;
use crate::server::GatewayServer;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{info, warn};

/// Build the gateway router.
///
/// Layers, outermost first: request-id assignment, request-id propagation,
/// access log, CORS, origin enforcement.
pub fn router(server: Arc<GatewayServer>) -> Router {
    let cors = cors_layer(&server.config().allowed_origins);
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(upgrade))
        .layer(middleware::from_fn_with_state(server.clone(), enforce_origin))
        .layer(cors)
        .layer(middleware::from_fn(access_log))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(server)
}

fn cors_layer(allowed: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET]);
    if allowed.is_empty() {
        return layer.allow_origin(AllowOrigin::any());
    }
    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring unparseable allowed origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Reject browser requests from origins outside a non-empty allow-list.
async fn enforce_origin(
    State(server): State<Arc<GatewayServer>>,
    request: Request,
    next: Next,
) -> Response {
    let allowed = &server.config().allowed_origins;
    if let Some(origin) = request.headers().get(header::ORIGIN) {
        let origin = origin.to_str().unwrap_or_default();
        if !allowed.is_empty() && !allowed.iter().any(|a| a == origin) {
            warn!(origin, path = %request.uri().path(), "origin not allowed");
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }
    next.run(request).await
}

async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        request_id = %request_id,
        "http request"
    );
    response
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn upgrade(
    State(server): State<Arc<GatewayServer>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let remote = remote.to_string();
    let limiter = server.rate_limiter();
    if !limiter.allow(&remote).await {
        let window = limiter.config().window;
        warn!(remote = %remote, window_secs = window.as_secs(), "upgrade refused: too many failed handshakes");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, window.as_secs().to_string())],
            "too many failed authentication attempts",
        )
            .into_response();
    }
    ws.max_message_size(MAX_PAYLOAD_BYTES)
        .on_upgrade(move |socket| server.handle_socket(socket, remote))
}
