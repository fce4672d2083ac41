//! Sliding-window limiter for failed handshakes.
//!
//! Failures are tracked per source host (the remote address with its port
//! stripped). A host that has accumulated `max_failures` failures inside
//! the window is refused at the HTTP upgrade, before any protocol bytes are
//! exchanged. Stale timestamps are purged lazily on every check and by a
//! background sweep; the table never holds more than `max_hosts` hosts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Limiter tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Failures within `window` that block a host.
    pub max_failures: usize,
    /// Age after which a failure no longer counts.
    pub window: Duration,
    /// Maximum number of distinct hosts tracked.
    pub max_hosts: usize,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(900),
            max_hosts: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Per-host failure table.
#[derive(Debug)]
pub struct AuthRateLimiter {
    config: RateLimitConfig,
    /// host → failure timestamps, oldest first.
    failures: RwLock<HashMap<String, Vec<Instant>>>,
}

/// Strip the port from `addr`, whatever it looks like; fall back to the
/// full string when `addr` cannot be split into host and port.
pub fn host_key(addr: &str) -> String {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return sock.ip().to_string();
    }
    split_host(addr).unwrap_or(addr).to_string()
}

/// The host half of `host:port` or `[host]:port`.
fn split_host(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        tail.starts_with(':').then_some(host).filter(|h| !h.is_empty())
    } else {
        let (host, _port) = addr.rsplit_once(':')?;
        (!host.is_empty() && !host.contains(':')).then_some(host)
    }
}

impl AuthRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            failures: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether `addr` may attempt a handshake.
    pub async fn allow(&self, addr: &str) -> bool {
        let host = host_key(addr);
        let now = Instant::now();
        let mut failures = self.failures.write().await;

        let Some(stamps) = failures.get_mut(&host) else {
            return true;
        };
        stamps.retain(|t| now.duration_since(*t) < self.config.window);
        let count = stamps.len();
        if count == 0 {
            failures.remove(&host);
        }
        count < self.config.max_failures
    }

    /// Record one failed handshake from `addr`.
    pub async fn record_failure(&self, addr: &str) {
        let host = host_key(addr);
        let now = Instant::now();
        let mut failures = self.failures.write().await;

        if !failures.contains_key(&host) && failures.len() >= self.config.max_hosts {
            let oldest = failures
                .iter()
                .filter_map(|(h, stamps)| stamps.first().map(|t| (h, *t)))
                .min_by_key(|(_, t)| *t)
                .map(|(h, _)| h.clone());
            if let Some(evicted) = oldest {
                failures.remove(&evicted);
                debug!(host = %evicted, "rate limiter full, evicted oldest host");
            }
        }

        let stamps = failures.entry(host.clone()).or_default();
        stamps.push(now);
        if stamps.len() >= self.config.max_failures {
            warn!(host = %host, failures = stamps.len(), "host reached auth failure limit");
        }
    }

    /// Purge stale failures across all hosts. Returns the number of hosts dropped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let mut failures = self.failures.write().await;
        let before = failures.len();
        failures.retain(|_, stamps| {
            stamps.retain(|t| now.duration_since(*t) < window);
            !stamps.is_empty()
        });
        before - failures.len()
    }

    /// Number of hosts currently tracked.
    pub async fn tracked_hosts(&self) -> usize {
        self.failures.read().await.len()
    }

    /// Whether `addr`'s host has an entry in the table.
    pub async fn is_tracked(&self, addr: &str) -> bool {
        self.failures.read().await.contains_key(&host_key(addr))
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `stop` is
    /// cancelled. Dropping the token without cancelling it leaves the
    /// task running for the life of the runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            // interval() panics on a zero period.
            let period = limiter.config.sweep_interval.max(Duration::from_millis(1));
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = limiter.sweep().await;
                        if removed > 0 {
                            debug!(removed, "rate limiter sweep");
                        }
                    }
                }
            }
        })
    }
}
