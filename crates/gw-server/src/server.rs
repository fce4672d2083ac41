//! The gateway server: owns shared state and drives every connection from
//! upgrade through handshake, dispatch and teardown.

use crate::auth::{resolve_auth, AuthRateLimiter, ResolvedAuth};
use crate::client::{Client, Connection};
use crate::collab::Collaborators;
use crate::config::ServerConfig;
use crate::handshake::{self, unix_millis, TICK_INTERVAL_MS};
use crate::http;
use crate::registry::ClientRegistry;
use crate::rpc::{MethodTable, RequestContext};
use crate::tls::{load_tls_config, TlsListener};
use axum::extract::ws::WebSocket;
use axum::serve::ListenerExt;
use gw_core::{codes, ErrorShape, Frame, GwError, GwResult, RequestFrame};
use serde_json::{json, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for in-flight requests.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on a single lifecycle hook call.
const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GatewayServer {
    config: ServerConfig,
    auth: ResolvedAuth,
    rate_limiter: Arc<AuthRateLimiter>,
    registry: ClientRegistry,
    methods: MethodTable,
    raw_config: RwLock<Value>,
    collab: Collaborators,
    event_seq: AtomicU64,
    started_at: Instant,
    /// Fired once shutdown begins; no connection is admitted afterwards.
    stopping: CancellationToken,
}

impl GatewayServer {
    /// Create a server. `raw_config` is the map behind `config.get`/`config.set`.
    pub fn new(config: ServerConfig, raw_config: Value, collab: Collaborators) -> Arc<Self> {
        let auth = resolve_auth(&config.auth);
        info!(mode = %auth.mode, "gateway auth configured");
        let rate_limiter = Arc::new(AuthRateLimiter::new(config.rate_limit.clone()));
        Arc::new(Self {
            config,
            auth,
            rate_limiter,
            registry: ClientRegistry::new(),
            methods: MethodTable::builtin(),
            raw_config: RwLock::new(raw_config),
            collab,
            event_seq: AtomicU64::new(0),
            started_at: Instant::now(),
            stopping: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &Arc<AuthRateLimiter> {
        &self.rate_limiter
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn raw_config(&self) -> &RwLock<Value> {
        &self.raw_config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Next sequence number for server-wide broadcasts.
    fn next_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Bind the configured address and serve until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> GwResult<()> {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GwError::Transport(format!("cannot bind {addr}: {e}")))?;

        match self.config.tls.clone() {
            Some(paths) => {
                let tls = Arc::new(load_tls_config(&paths.cert, &paths.key)?);
                self.serve_tls(listener, tls, cancel).await
            }
            None => self.serve(listener, cancel).await,
        }
    }

    /// Serve plain HTTP/WebSocket on an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> GwResult<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, tls = false, "gateway listening");
        let app = http::router(self.clone()).into_make_service_with_connect_info::<SocketAddr>();
        let stop_accepting = CancellationToken::new();
        let graceful = stop_accepting.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await
        });
        self.drive(task, stop_accepting, cancel).await
    }

    /// Serve HTTPS/WSS on an already-bound listener.
    pub async fn serve_tls(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Arc<rustls::ServerConfig>,
        cancel: CancellationToken,
    ) -> GwResult<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, tls = true, "gateway listening");
        // TapIo carries SocketAddr connect info through to the router.
        let listener = TlsListener::new(listener, tls).tap_io(|_| {});
        let app = http::router(self.clone()).into_make_service_with_connect_info::<SocketAddr>();
        let stop_accepting = CancellationToken::new();
        let graceful = stop_accepting.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await
        });
        self.drive(task, stop_accepting, cancel).await
    }

    /// Run background tasks alongside the accept loop and perform the
    /// shutdown sequence once `cancel` fires.
    async fn drive(
        self: &Arc<Self>,
        mut accept: JoinHandle<io::Result<()>>,
        stop_accepting: CancellationToken,
        cancel: CancellationToken,
    ) -> GwResult<()> {
        let background = cancel.child_token();
        self.rate_limiter.spawn_sweeper(background.clone());
        self.spawn_ticker(background.clone());
        self.emit_hook("gateway.start", json!({ "version": self.version() }))
            .await;
        info!("gateway ready");

        let finished_early = tokio::select! {
            result = &mut accept => Some(result),
            _ = cancel.cancelled() => None,
        };
        if let Some(result) = finished_early {
            background.cancel();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(GwError::Transport(format!("server error: {e}"))),
                Err(e) => Err(GwError::Other(format!("server task failed: {e}"))),
            };
        }

        self.close_clients().await;
        stop_accepting.cancel();

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut accept).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(GwError::Transport(format!("server error: {e}"))),
            Ok(Err(e)) => return Err(GwError::Other(format!("server task failed: {e}"))),
            Err(_) => {
                warn!("in-flight requests did not finish within the grace period");
                accept.abort();
            }
        }
        info!("gateway stopped");
        Ok(())
    }

    /// Stop admitting connections, notify every client, then close them all.
    /// Connections still in the handshake are closed by their own task.
    pub(crate) async fn close_clients(&self) {
        self.stopping.cancel();
        let clients = self.registry.count().await;
        info!(clients, "shutting down gateway");
        self.emit_hook("gateway.stop", json!({})).await;
        let notified = self
            .registry
            .broadcast("shutdown", &json!({ "reason": "server shutdown" }), self.next_seq())
            .await;
        debug!(notified, "shutdown notice sent");
        self.registry.close_all().await;
    }

    fn spawn_ticker(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let seq = server.next_seq();
                        server.registry.broadcast("tick", &json!({ "ts": unix_millis() }), seq).await;
                    }
                }
            }
        })
    }

    async fn emit_hook(&self, event: &str, data: Value) {
        let Some(hooks) = &self.collab.hooks else {
            return;
        };
        match tokio::time::timeout(HOOK_TIMEOUT, hooks.emit(event, data)).await {
            Ok(Ok(())) => debug!(event, "hook emitted"),
            Ok(Err(e)) => warn!(event, error = %e, "hook failed"),
            Err(_) => warn!(event, "hook timed out"),
        }
    }

    /// Own one upgraded socket for its whole life.
    pub(crate) async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: String) {
        self.handle_connection(Connection::from_socket(socket), remote)
            .await
    }

    pub(crate) async fn handle_connection(self: Arc<Self>, conn: Connection, remote: String) {
        debug!(remote = %remote, "connection upgraded");
        let handshake = tokio::select! {
            result = handshake::perform(&conn, &self.auth, &remote) => Some(result),
            _ = self.stopping.cancelled() => None,
        };
        let admitted = match handshake {
            Some(Ok(admitted)) if !self.stopping.is_cancelled() => admitted,
            Some(Err(e)) => {
                warn!(remote = %remote, error = %e, "handshake failed");
                self.rate_limiter.record_failure(&remote).await;
                conn.close().await;
                return;
            }
            _ => {
                debug!(remote = %remote, "shutting down, dropping handshake");
                conn.close().await;
                return;
            }
        };

        let client = Arc::new(Client::new(conn, admitted.params.client, admitted.auth, remote));
        let hello = match handshake::build_hello(
            &admitted.request_id,
            &client.id,
            self.methods.methods(),
            option_env!("GW_BUILD_COMMIT").map(str::to_string),
        ) {
            Ok(frame) => frame,
            Err(e) => {
                error!(conn_id = %client.id, error = %e, "cannot build hello");
                client.close().await;
                return;
            }
        };
        // HelloOK must be the first response the client sees, so register
        // only after it is on the wire.
        if let Err(e) = client.send(&hello).await {
            debug!(conn_id = %client.id, error = %e, "client left before hello");
            client.close().await;
            return;
        }
        if !self.registry.add(client.clone()).await {
            debug!(conn_id = %client.id, "shutting down, not registering client");
            client.close().await;
            return;
        }
        info!(
            conn_id = %client.id,
            client_id = %client.info.id,
            remote = %client.remote,
            "client connected"
        );

        self.read_loop(&client).await;

        self.registry.remove(&client.id).await;
        client.close().await;
        info!(conn_id = %client.id, "client disconnected");
    }

    async fn read_loop(self: &Arc<Self>, client: &Arc<Client>) {
        loop {
            match client.read_frame().await {
                Ok(Some(Frame::Request(request))) => self.dispatch(client, request).await,
                Ok(Some(other)) => {
                    debug!(conn_id = %client.id, kind = other.kind(), "ignoring non-request frame");
                }
                Ok(None) => break,
                Err(GwError::Codec(e)) => {
                    warn!(conn_id = %client.id, error = %e, "undecodable frame");
                    let frame = Frame::error("", ErrorShape::new(codes::PARSE_ERROR, format!("parse error: {e}")));
                    if client.send(&frame).await.is_err() {
                        break;
                    }
                }
                Err(GwError::BadRequest { id, reason }) => {
                    warn!(conn_id = %client.id, id = %id, error = %reason, "malformed request");
                    let frame = Frame::error(id, ErrorShape::new(codes::INVALID_PARAMS, format!("invalid request: {reason}")));
                    if client.send(&frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(conn_id = %client.id, error = %e, "read failed");
                    break;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, client: &Arc<Client>, request: RequestFrame) {
        let Some(handler) = self.methods.get(&request.method) else {
            debug!(conn_id = %client.id, method = %request.method, "unknown method");
            let message = format!("unknown method: {}", request.method);
            let frame = Frame::error(request.id, ErrorShape::new(codes::METHOD_NOT_FOUND, message));
            if let Err(e) = client.send(&frame).await {
                debug!(conn_id = %client.id, error = %e, "cannot send response");
            }
            return;
        };
        debug!(conn_id = %client.id, method = %request.method, id = %request.id, "dispatching");
        let ctx = RequestContext::new(self.clone(), client.clone(), request);
        if let Err(e) = handler(&ctx).await {
            warn!(conn_id = %client.id, method = %ctx.request.method, error = %e, "handler failed");
        }
    }
}
