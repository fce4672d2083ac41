//! `health`, `channels.status` and `session.list`.

use crate::rpc::{HandlerFuture, RequestContext};
use serde_json::json;

pub fn health(ctx: &RequestContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let server = &ctx.server;
        let clients = server.registry().count().await;
        let payload = json!({
            "status": "ok",
            "version": server.version(),
            "protocol": gw_core::PROTOCOL_VERSION,
            "clients": clients,
            "uptimeMs": server.uptime().as_millis() as u64,
        });
        ctx.respond(&payload).await
    })
}

pub fn channels_status(ctx: &RequestContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let channels = ctx
            .server
            .collaborators()
            .channels
            .as_ref()
            .map(|registry| registry.status())
            .unwrap_or_default();
        ctx.respond(&json!({ "channels": channels })).await
    })
}

// Session storage lives outside the gateway.
pub fn session_list(ctx: &RequestContext) -> HandlerFuture<'_> {
    Box::pin(async move { ctx.respond(&json!({ "sessions": [] })).await })
}

#[cfg(test)]
mod tests {
    use crate::client::testing::memory_client;
    use crate::collab::{ChannelRegistry, ChannelStatus, Collaborators};
    use crate::rpc::RequestContext;
    use crate::server::testing::{test_server, test_server_with};
    use gw_core::Frame;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct FixedChannels;

    impl ChannelRegistry for FixedChannels {
        fn status(&self) -> Vec<ChannelStatus> {
            vec![ChannelStatus {
                channel_id: "telegram".into(),
                connected: true,
                running: true,
                last_error: None,
            }]
        }
    }

    async fn call(
        server: Arc<crate::server::GatewayServer>,
        method: &str,
        handler: crate::rpc::Handler,
    ) -> Value {
        let (client, mut peer) = memory_client("t");
        let Frame::Request(req) = Frame::request("1", method, &()).unwrap() else {
            panic!("expected request");
        };
        let ctx = RequestContext::new(server, Arc::new(client), req);
        handler(&ctx).await.unwrap();
        let Some(Frame::Response(resp)) = peer.next_frame().await else {
            panic!("expected response");
        };
        assert_eq!(resp.ok, Some(true));
        resp.payload.unwrap()
    }

    #[tokio::test]
    async fn health_reports_status_and_clients() {
        let server = test_server();
        let (other, _peer) = memory_client("other");
        server.registry().add(Arc::new(other)).await;

        let payload = call(server, "health", super::health).await;
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["clients"], 1);
        assert!(payload["version"].is_string());
    }

    #[tokio::test]
    async fn channels_status_without_registry_is_empty() {
        let payload = call(test_server(), "channels.status", super::channels_status).await;
        assert_eq!(payload, json!({ "channels": [] }));
    }

    #[tokio::test]
    async fn channels_status_delegates_to_registry() {
        let server = test_server_with(Collaborators {
            channels: Some(Arc::new(FixedChannels)),
            ..Default::default()
        });
        let payload = call(server, "channels.status", super::channels_status).await;
        assert_eq!(payload["channels"][0]["channelId"], "telegram");
        assert_eq!(payload["channels"][0]["connected"], true);
    }

    #[tokio::test]
    async fn session_list_is_empty() {
        let payload = call(test_server(), "session.list", super::session_list).await;
        assert_eq!(payload, json!({ "sessions": [] }));
    }
}
