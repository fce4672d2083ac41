//! End-to-end tests: a real gateway on 127.0.0.1:0 driven by a
//! tokio-tungstenite client.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use gw_core::{
    frame_decode, frame_encode, ClientInfo, ConnectAuth, ConnectParams, Frame, GwResult, HelloOk,
    ResponseFrame, CONNECT_METHOD, PROTOCOL_VERSION,
};
use gw_server::config::AuthSection;
use gw_server::tls::{generate_self_signed_cert, load_tls_config};
use gw_server::{
    AgentRunner, Collaborators, GatewayServer, InboundMessage, RunResult, ServerConfig,
    StreamCallback, StreamEvent,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN: &str = "e2e-token";

struct Gateway {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<GwResult<()>>,
}

impl Gateway {
    async fn start(config: ServerConfig, collab: Collaborators) -> Self {
        let raw = json!({ "gateway": { "port": config.port, "auth": { "token": TOKEN } } });
        let server = GatewayServer::new(config, raw, collab);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.serve(listener, cancel.clone()));
        Self { addr, cancel, task }
    }

    async fn start_default() -> Self {
        Self::start(config(), Collaborators::default()).await
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn stop(self) {
        self.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok(), "server returned {result:?}");
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        auth: AuthSection {
            mode: Some("token".into()),
            token: TOKEN.into(),
            password: String::new(),
        },
        ..Default::default()
    }
}

async fn send<S>(ws: &mut WebSocketStream<S>, frame: &Frame)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::Text(frame_encode(frame).unwrap()))
        .await
        .unwrap();
}

/// Next frame, or `None` once the server closes.
async fn next_frame<S>(ws: &mut WebSocketStream<S>) -> Option<Frame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(frame_decode(text.as_bytes()).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn next_response<S>(ws: &mut WebSocketStream<S>) -> ResponseFrame
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match next_frame(ws).await {
            Some(Frame::Response(resp)) => return resp,
            Some(Frame::Event(ev)) if ev.event == "tick" => continue,
            other => panic!("expected response, got {other:?}"),
        }
    }
}

fn connect_request(token: &str) -> Frame {
    let params = ConnectParams {
        min_protocol: PROTOCOL_VERSION,
        max_protocol: PROTOCOL_VERSION,
        client: ClientInfo {
            id: "e2e".into(),
            version: "1.0.0".into(),
            platform: "test".into(),
            mode: "cli".into(),
            ..Default::default()
        },
        auth: Some(ConnectAuth {
            token: Some(token.into()),
            password: None,
        }),
        caps: Vec::new(),
    };
    Frame::request("connect", CONNECT_METHOD, &params).unwrap()
}

/// Open a socket and answer the challenge with `token`.
async fn handshake(gw: &Gateway, token: &str) -> (Ws, ResponseFrame) {
    let (mut ws, _) = tokio_tungstenite::connect_async(gw.url()).await.unwrap();
    let Some(Frame::Event(challenge)) = next_frame(&mut ws).await else {
        panic!("expected challenge");
    };
    assert_eq!(challenge.event, "connect.challenge");
    assert_eq!(challenge.seq, 0);
    send(&mut ws, &connect_request(token)).await;
    let resp = next_response(&mut ws).await;
    (ws, resp)
}

async fn connect(gw: &Gateway) -> (Ws, HelloOk) {
    let (ws, resp) = handshake(gw, TOKEN).await;
    assert_eq!(resp.ok, Some(true), "handshake failed: {:?}", resp.error);
    (ws, resp.decode_payload().unwrap().unwrap())
}

async fn call(ws: &mut Ws, id: &str, method: &str, params: Value) -> ResponseFrame {
    send(ws, &Frame::request(id, method, &params).unwrap()).await;
    let resp = next_response(ws).await;
    assert_eq!(resp.id, id);
    resp
}

fn error_code(resp: &ResponseFrame) -> &str {
    resp.error.as_ref().map(|e| e.code.as_str()).unwrap_or("")
}

#[tokio::test]
async fn handshake_returns_hello() {
    let gw = Gateway::start_default().await;
    let (_ws, hello) = connect(&gw).await;

    assert_eq!(hello.kind, "hello-ok");
    assert_eq!(hello.protocol, PROTOCOL_VERSION);
    assert!(!hello.server.conn_id.is_empty());
    assert!(hello.features.methods.iter().any(|m| m == "health"));
    assert_eq!(hello.policy.tick_interval_ms, 30_000);

    gw.stop().await;
}

#[tokio::test]
async fn wrong_token_is_rejected_and_socket_closed() {
    let gw = Gateway::start_default().await;
    let (mut ws, resp) = handshake(&gw, "not-the-token").await;

    assert_eq!(resp.ok, Some(false));
    let error = resp.error.unwrap();
    assert_eq!(error.code, "unauthorized");
    assert_eq!(error.message, "token_mismatch");
    assert!(next_frame(&mut ws).await.is_none());

    gw.stop().await;
}

#[tokio::test]
async fn repeated_failures_block_the_upgrade() {
    let mut config = config();
    config.rate_limit.max_failures = 2;
    let gw = Gateway::start(config, Collaborators::default()).await;

    for _ in 0..2 {
        let (mut ws, resp) = handshake(&gw, "bad").await;
        assert_eq!(error_code(&resp), "unauthorized");
        // The failure is recorded before the server closes.
        assert!(next_frame(&mut ws).await.is_none());
    }

    match tokio_tungstenite::connect_async(gw.url()).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 429);
            assert_eq!(response.headers()["retry-after"], "900");
        }
        other => panic!("expected HTTP 429, got {:?}", other.map(|_| ())),
    }

    gw.stop().await;
}

#[tokio::test]
async fn first_frame_must_be_connect() {
    let gw = Gateway::start_default().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(gw.url()).await.unwrap();
    next_frame(&mut ws).await;

    send(&mut ws, &Frame::request("1", "health", &()).unwrap()).await;
    let resp = next_response(&mut ws).await;
    assert_eq!(error_code(&resp), "protocol_error");
    assert!(next_frame(&mut ws).await.is_none());

    gw.stop().await;
}

#[tokio::test]
async fn config_allow_list() {
    let gw = Gateway::start_default().await;
    let (mut ws, _) = connect(&gw).await;

    let resp = call(&mut ws, "1", "config.get", json!({"path": "gateway.auth.token"})).await;
    assert_eq!(error_code(&resp), "forbidden");
    let resp = call(
        &mut ws,
        "2",
        "config.set",
        json!({"path": "gateway.auth.token", "value": "x"}),
    )
    .await;
    assert_eq!(error_code(&resp), "forbidden");

    let resp = call(&mut ws, "3", "config.set", json!({"path": "gateway.port", "value": 20001})).await;
    assert_eq!(resp.ok, Some(true));
    let resp = call(&mut ws, "4", "config.get", json!({"path": "gateway.port"})).await;
    assert_eq!(resp.payload.unwrap()["value"], 20001);

    gw.stop().await;
}

#[tokio::test]
async fn unknown_method_and_bad_json() {
    let gw = Gateway::start_default().await;
    let (mut ws, _) = connect(&gw).await;

    let resp = call(&mut ws, "m1", "does.not.exist", Value::Null).await;
    assert_eq!(resp.ok, Some(false));
    assert_eq!(error_code(&resp), "method_not_found");

    ws.send(Message::Text("{\"type\":".into())).await.unwrap();
    let resp = next_response(&mut ws).await;
    assert_eq!(resp.id, "");
    assert_eq!(error_code(&resp), "-32700");

    let resp = call(&mut ws, "h1", "health", Value::Null).await;
    assert_eq!(resp.payload.unwrap()["clients"], 1);

    gw.stop().await;
}

struct ScriptedRunner;

impl AgentRunner for ScriptedRunner {
    fn run(
        &self,
        _cancel: CancellationToken,
        message: InboundMessage,
    ) -> BoxFuture<'_, anyhow::Result<RunResult>> {
        Box::pin(async move {
            Ok(RunResult {
                response: format!("you said {}", message.text),
                session_id: "sess".into(),
                model: "scripted".into(),
                ..Default::default()
            })
        })
    }

    fn run_stream(
        &self,
        _cancel: CancellationToken,
        _message: InboundMessage,
        on_event: StreamCallback,
    ) -> BoxFuture<'_, anyhow::Result<RunResult>> {
        Box::pin(async move {
            for piece in ["one ", "two ", "three"] {
                on_event(StreamEvent::Delta(piece.into()));
            }
            on_event(StreamEvent::Done);
            Ok(RunResult {
                response: String::new(),
                session_id: "sess".into(),
                model: "scripted".into(),
                ..Default::default()
            })
        })
    }
}

#[tokio::test]
async fn chat_send_and_stream() {
    let collab = Collaborators {
        runner: Some(Arc::new(ScriptedRunner)),
        ..Default::default()
    };
    let gw = Gateway::start(config(), collab).await;
    let (mut ws, _) = connect(&gw).await;

    let resp = call(&mut ws, "c1", "chat.send", json!({"message": "hi"})).await;
    let payload = resp.payload.unwrap();
    assert_eq!(payload["response"], "you said hi");
    assert_eq!(payload["model"], "scripted");

    send(
        &mut ws,
        &Frame::request("c2", "chat.stream", &json!({"message": "count"})).unwrap(),
    )
    .await;
    let mut seqs = Vec::new();
    let final_resp = loop {
        match next_frame(&mut ws).await {
            Some(Frame::Event(ev)) if ev.event == "chat.delta" => seqs.push(ev.seq),
            Some(Frame::Event(_)) => {}
            Some(Frame::Response(resp)) => break resp,
            other => panic!("unexpected {other:?}"),
        }
    };
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(final_resp.id, "c2");
    assert_eq!(final_resp.payload.unwrap()["response"], "one two three");

    gw.stop().await;
}

#[tokio::test]
async fn chat_without_runner_is_unavailable() {
    let gw = Gateway::start_default().await;
    let (mut ws, _) = connect(&gw).await;
    let resp = call(&mut ws, "c1", "chat.send", json!({"message": "hi"})).await;
    assert_eq!(error_code(&resp), "unavailable");
    gw.stop().await;
}

#[tokio::test]
async fn shutdown_notifies_and_closes_clients() {
    let gw = Gateway::start_default().await;
    let (mut ws, _) = connect(&gw).await;

    gw.cancel.cancel();
    let Some(Frame::Event(ev)) = next_frame(&mut ws).await else {
        panic!("expected shutdown event");
    };
    assert_eq!(ev.event, "shutdown");
    assert_eq!(ev.payload.unwrap()["reason"], "server shutdown");
    assert!(next_frame(&mut ws).await.is_none());

    let result = tokio::time::timeout(Duration::from_secs(10), gw.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn shutdown_during_handshake_admits_nobody() {
    let gw = Gateway::start_default().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(gw.url()).await.unwrap();
    let Some(Frame::Event(challenge)) = next_frame(&mut ws).await else {
        panic!("expected challenge");
    };
    assert_eq!(challenge.event, "connect.challenge");

    gw.cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), gw.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    // The socket may already be gone; either way no hello may follow.
    let _ = ws
        .send(Message::Text(frame_encode(&connect_request(TOKEN)).unwrap()))
        .await;
    assert!(next_frame(&mut ws).await.is_none());
}

#[tokio::test]
async fn malformed_request_keeps_its_id() {
    let gw = Gateway::start_default().await;
    let (mut ws, _) = connect(&gw).await;

    ws.send(Message::Text(r#"{"type":"request","id":"q7"}"#.into()))
        .await
        .unwrap();
    let resp = next_response(&mut ws).await;
    assert_eq!(resp.id, "q7");
    assert_eq!(error_code(&resp), "invalid_params");

    gw.stop().await;
}

/// A rustls client that trusts only the certificate at `cert_path`.
fn trusting_connector(cert_path: &std::path::Path) -> tokio_rustls::TlsConnector {
    let pem = std::fs::read(cert_path).unwrap();
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        roots.add(cert.unwrap()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn handshake_over_tls() {
    let dir = tempfile::tempdir().unwrap();
    let (cert_path, key_path) = generate_self_signed_cert(dir.path()).unwrap();
    let tls = Arc::new(load_tls_config(&cert_path, &key_path).unwrap());

    let server = GatewayServer::new(config(), json!({}), Collaborators::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(server.serve_tls(listener, tls, cancel.clone()));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let stream = trusting_connector(&cert_path)
        .connect(name, tcp)
        .await
        .unwrap();
    let url = format!("wss://localhost:{}/ws", addr.port());
    let (mut ws, _) = tokio_tungstenite::client_async(url, stream).await.unwrap();

    let Some(Frame::Event(challenge)) = next_frame(&mut ws).await else {
        panic!("expected challenge");
    };
    assert_eq!(challenge.event, "connect.challenge");
    send(&mut ws, &connect_request(TOKEN)).await;
    let resp = next_response(&mut ws).await;
    assert_eq!(resp.ok, Some(true), "handshake failed: {:?}", resp.error);
    let hello: HelloOk = resp.decode_payload().unwrap().unwrap();
    assert!(!hello.server.conn_id.is_empty());

    send(&mut ws, &Frame::request("h1", "health", &()).unwrap()).await;
    let health = next_response(&mut ws).await;
    assert_eq!(health.payload.unwrap()["clients"], 1);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn public_health_probe() {
    let gw = Gateway::start_default().await;

    let mut stream = TcpStream::connect(gw.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut body = String::new();
    stream.read_to_string(&mut body).await.unwrap();

    assert!(body.starts_with("HTTP/1.1 200"));
    assert!(body.to_ascii_lowercase().contains("x-request-id"));
    assert!(body.ends_with("{\"status\":\"ok\"}"));

    gw.stop().await;
}
