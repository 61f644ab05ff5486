use std::net::SocketAddr;
use std::time::Duration;

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the websocket/status HTTP listener binds to.
    pub http_addr: SocketAddr,
    /// How long `cancel` waits for a worker acknowledgement before
    /// force-marking the job cancelled.
    pub cancel_timeout: Duration,
    /// Path of the CI config file fetched from the repository.
    pub config_file: String,
    pub coordination: CoordinationConfig,
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// TTL granted to worker liveness leases.
    pub lease_ttl: Duration,
    /// Backoff between watch reconnect attempts.
    pub watch_backoff: Duration,
    /// Consecutive reconnect failures tolerated before the registry
    /// gives up and reports a fatal error.
    pub max_watch_retries: u32,
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Bounded event buffer; a lagging consumer loses the oldest events.
    pub buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8090".parse().unwrap(),
            cancel_timeout: Duration::from_secs(10),
            config_file: ".bantam.yml".to_string(),
            coordination: CoordinationConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5),
            watch_backoff: Duration::from_millis(500),
            max_watch_retries: 5,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

impl ServerConfig {
    pub fn new(http_addr: SocketAddr) -> Self {
        Self {
            http_addr,
            ..Default::default()
        }
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }
}
