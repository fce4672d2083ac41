//! `config.get` / `config.set` over the raw config map.
//!
//! Only dotted paths under [`ALLOWED_PREFIXES`] are reachable. Credentials,
//! TLS material and the origin allow-list are never exposed or writable.

use crate::config::{get_path, set_path};
use crate::rpc::{HandlerFuture, RequestContext};
use gw_core::{codes, ErrorShape};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Config subtrees reachable from a client.
pub const ALLOWED_PREFIXES: &[&str] = &[
    "agent",
    "agents",
    "channels",
    "session",
    "logging",
    "hooks",
    "gateway.port",
    "gateway.bind",
];

/// True when `path` equals an allowed prefix or lies beneath one.
pub fn path_allowed(path: &str) -> bool {
    ALLOWED_PREFIXES.iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
    })
}

#[derive(Debug, Default, Deserialize)]
struct GetParams {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Default, Deserialize)]
struct SetParams {
    #[serde(default)]
    path: String,
    #[serde(default)]
    value: Value,
}

/// Shared path checks. `Ok(false)` means an error response was sent.
async fn check_path(ctx: &RequestContext, path: &str) -> gw_core::GwResult<bool> {
    if path.is_empty() {
        ctx.respond_error(codes::INVALID_PARAMS, "path is required")
            .await?;
        return Ok(false);
    }
    if !path_allowed(path) {
        warn!(conn_id = %ctx.client.id, path, "config path not allowed");
        let error = ErrorShape::new(codes::FORBIDDEN, format!("config path not allowed: {path}"))
            .with_details(json!({ "path": path, "allowed": ALLOWED_PREFIXES }));
        ctx.respond_shape(error).await?;
        return Ok(false);
    }
    Ok(true)
}

pub fn get(ctx: &RequestContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Some(params) = ctx.params_or_reject::<GetParams>().await? else {
            return Ok(());
        };
        if !check_path(ctx, &params.path).await? {
            return Ok(());
        }

        let value = {
            let raw = ctx.server.raw_config().read().await;
            get_path(&raw, &params.path).cloned()
        };
        match value {
            Some(value) => {
                ctx.respond(&json!({ "path": params.path, "value": value }))
                    .await
            }
            None => {
                let message = format!("config path not found: {}", params.path);
                ctx.respond_shape(ErrorShape::new(codes::NOT_FOUND, message).with_details(json!({ "path": params.path })))
                    .await
            }
        }
    })
}

pub fn set(ctx: &RequestContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let Some(params) = ctx.params_or_reject::<SetParams>().await? else {
            return Ok(());
        };
        if !check_path(ctx, &params.path).await? {
            return Ok(());
        }

        let result = {
            let mut raw = ctx.server.raw_config().write().await;
            set_path(&mut raw, &params.path, params.value.clone())
        };
        match result {
            Ok(()) => {
                info!(conn_id = %ctx.client.id, path = %params.path, "config value updated");
                ctx.respond(&json!({ "path": params.path, "value": params.value }))
                    .await
            }
            Err(e) => ctx.respond_error(codes::INVALID_PARAMS, e.to_string()).await,
        }
    })
}
