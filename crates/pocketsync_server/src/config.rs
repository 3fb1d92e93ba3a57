//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Request path the WebSocket upgrade is served at.
    pub ws_path: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum concurrent connections per authenticated user.
    pub max_clients_per_user: usize,
    /// Maximum live subscriptions per client.
    pub max_subscriptions_per_client: usize,
    /// How long a connection may sit without a handshake.
    pub handshake_timeout: Duration,
    /// Idle time after which a session is pruned.
    pub idle_ttl: Duration,
    /// How often the idle pruner runs.
    pub prune_interval: Duration,
    /// Batch window for subscription deltas.
    pub batch_interval: Duration,
    /// Entry count at which a batch window flushes early.
    pub max_batch_size: usize,
    /// Maximum records per collection in a pull response.
    pub max_pull_batch: u32,
    /// Maximum changes accepted in one push.
    pub max_push_batch: usize,
    /// Outbound message queue depth per connection.
    pub outbound_queue_size: usize,
    /// Whether to require authentication.
    pub require_auth: bool,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ws_path: "/sync".to_string(),
            max_connections: 1000,
            max_clients_per_user: 8,
            max_subscriptions_per_client: 32,
            handshake_timeout: Duration::from_secs(10),
            idle_ttl: Duration::from_secs(300),
            prune_interval: Duration::from_secs(30),
            batch_interval: Duration::from_millis(50),
            max_batch_size: 500,
            max_pull_batch: 100,
            max_push_batch: 100,
            outbound_queue_size: 64,
            require_auth: false,
        }
    }

    /// Sets the WebSocket upgrade path.
    pub fn with_ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the per-user connection cap.
    pub fn with_max_clients_per_user(mut self, max: usize) -> Self {
        self.max_clients_per_user = max;
        self
    }

    /// Sets the per-client subscription cap.
    pub fn with_max_subscriptions_per_client(mut self, max: usize) -> Self {
        self.max_subscriptions_per_client = max;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the idle TTL and pruner interval.
    pub fn with_idle_ttl(mut self, ttl: Duration, prune_interval: Duration) -> Self {
        self.idle_ttl = ttl;
        self.prune_interval = prune_interval;
        self
    }

    /// Sets the delta batch window.
    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    /// Sets the early-flush batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: u32) -> Self {
        self.max_pull_batch = size;
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Requires every connection to present a valid token.
    pub fn with_required_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.ws_path, "/sync");
        assert!(!config.require_auth);
        assert_eq!(config.batch_interval, Duration::from_millis(50));
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_connections(500)
            .with_max_pull_batch(50)
            .with_batch_interval(Duration::from_millis(10))
            .with_required_auth();

        assert_eq!(config.max_connections, 500);
        assert_eq!(config.max_pull_batch, 50);
        assert_eq!(config.batch_interval, Duration::from_millis(10));
        assert!(config.require_auth);
    }
}
