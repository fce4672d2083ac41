//! Method dispatch table and per-request context.

use crate::client::Client;
use crate::server::GatewayServer;
use futures_util::future::BoxFuture;
use gw_core::{codes, ErrorShape, Frame, GwError, GwResult, RequestFrame};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Future returned by a method handler. `Err` means the response could not
/// be delivered; request-level failures are sent as error responses.
pub type HandlerFuture<'a> = BoxFuture<'a, GwResult<()>>;

/// A method handler.
pub type Handler = for<'a> fn(&'a RequestContext) -> HandlerFuture<'a>;

/// Name → handler mapping. Built once, read-only afterwards.
#[derive(Default)]
pub struct MethodTable {
    handlers: HashMap<&'static str, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table of built-in gateway methods.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        crate::handlers::register(&mut table);
        table
    }

    pub fn register(&mut self, method: &'static str, handler: Handler) {
        self.handlers.insert(method, handler);
    }

    pub fn get(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).copied()
    }

    /// Sorted method names, as advertised in the handshake.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().map(|m| m.to_string()).collect();
        names.sort_unstable();
        names
    }
}

/// One inbound request plus everything a handler needs to answer it.
pub struct RequestContext {
    pub server: Arc<GatewayServer>,
    pub client: Arc<Client>,
    pub request: RequestFrame,
}

impl RequestContext {
    pub fn new(server: Arc<GatewayServer>, client: Arc<Client>, request: RequestFrame) -> Self {
        Self {
            server,
            client,
            request,
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    /// Send the success response.
    pub async fn respond<T: Serialize>(&self, payload: &T) -> GwResult<()> {
        let frame = Frame::ok(self.id(), payload)?;
        self.client.send(&frame).await
    }

    /// Send an error response.
    pub async fn respond_error(&self, code: &str, message: impl Into<String>) -> GwResult<()> {
        self.respond_shape(ErrorShape::new(code, message)).await
    }

    /// Send an error response carrying details or retry hints.
    pub async fn respond_shape(&self, error: ErrorShape) -> GwResult<()> {
        self.client.send(&Frame::error(self.id(), error)).await
    }

    /// Decode the request parameters. Absent parameters yield `T::default()`.
    pub fn params<T: DeserializeOwned + Default>(&self) -> GwResult<T> {
        Ok(self.request.decode_params()?.unwrap_or_default())
    }

    /// Decode parameters, answering `invalid_params` on failure.
    ///
    /// Returns `Ok(None)` when the error response has already been sent.
    pub async fn params_or_reject<T: DeserializeOwned + Default>(&self) -> GwResult<Option<T>> {
        match self.params() {
            Ok(params) => Ok(Some(params)),
            Err(GwError::Codec(e)) => {
                self.respond_error(codes::INVALID_PARAMS, format!("invalid params: {e}"))
                    .await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send an event frame to the requesting client only.
    pub async fn emit<T: Serialize>(&self, event: &str, payload: &T, seq: u64) -> GwResult<()> {
        let frame = Frame::event(event, payload, seq)?;
        self.client.send(&frame).await
    }
}
