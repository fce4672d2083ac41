//! Registry of authenticated connections.
//!
//! Supports lookup, broadcast, and bulk close. Sends and closes happen on a
//! snapshot taken outside the lock, concurrently and each under a deadline,
//! so one slow client cannot stall others.

use crate::client::Client;
use futures_util::future::join_all;
use gw_core::Frame;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How long a broadcast waits on one client before dropping it.
pub const BROADCAST_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Inner {
    clients: HashMap<String, Arc<Client>>,
    /// Set by [`ClientRegistry::close_all`]; later registrations are refused.
    closed: bool,
}

/// Live set of authenticated, open connections.
#[derive(Default)]
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its connection id. Returns `false`, leaving
    /// the client unregistered, once the registry has been closed.
    pub async fn add(&self, client: Arc<Client>) -> bool {
        let id = client.id.clone();
        let mut inner = self.inner.write().await;
        if inner.closed {
            return false;
        }
        inner.clients.insert(id.clone(), client);
        info!(conn_id = %id, total = inner.clients.len(), "client registered");
        true
    }

    /// Remove a client. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: &str) -> Option<Arc<Client>> {
        let removed = self.inner.write().await.clients.remove(id);
        if removed.is_some() {
            debug!(conn_id = %id, "client unregistered");
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Client>> {
        self.inner.read().await.clients.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    /// Send the same event to every registered client.
    ///
    /// Per-client failures are logged, not returned. A client that does not
    /// accept the event within [`BROADCAST_SEND_TIMEOUT`] is removed and
    /// closed. Returns how many clients the event was delivered to.
    pub async fn broadcast<T: Serialize>(&self, event: &str, payload: &T, seq: u64) -> usize {
        let frame = match Frame::event(event, payload, seq) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event, error = %e, "failed to encode broadcast event");
                return 0;
            }
        };

        let targets: Vec<Arc<Client>> = self.inner.read().await.clients.values().cloned().collect();
        let sends = targets.into_iter().map(|client| {
            let frame = &frame;
            async move {
                let result = tokio::time::timeout(BROADCAST_SEND_TIMEOUT, client.send(frame)).await;
                (client, result)
            }
        });

        let mut delivered = 0;
        let mut stalled = Vec::new();
        for (client, result) in join_all(sends).await {
            match result {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(conn_id = %client.id, event, error = %e, "broadcast send failed"),
                Err(_) => {
                    warn!(conn_id = %client.id, event, "client not draining, dropping it");
                    stalled.push(client);
                }
            }
        }
        for client in &stalled {
            self.remove(&client.id).await;
        }
        join_all(stalled.iter().map(|client| client.close())).await;
        delivered
    }

    /// Close and remove every client, and refuse any later registration.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Client>> = {
            let mut inner = self.inner.write().await;
            inner.closed = true;
            inner.clients.drain().map(|(_, c)| c).collect()
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "closing all clients");
        }
        join_all(drained.iter().map(|client| client.close())).await;
    }
}
