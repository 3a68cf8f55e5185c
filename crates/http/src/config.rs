//! Server configuration.
//!
//! Configuration is an explicit value built once at startup and shared by every component
//! through an `Arc`. There is no process wide registry.

use std::net::SocketAddr;
use std::time::Duration;

/// Tunables of the HTTP server, see [`ServerConfig::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: SocketAddr,
    /// Period of the accept and keep-alive polling loop.
    pub tick_interval: Duration,
    /// Upper bound of new connections accepted within one tick.
    pub max_accepts_per_tick: usize,
    /// Idle keep-alive connections are closed after this long.
    pub keep_alive_timeout: Duration,
    /// How long a request may take to deliver its first byte.
    pub first_byte_timeout: Duration,
    pub read_buffer_size: usize,
    pub max_header_bytes: usize,
    pub max_header_count: usize,
    /// Capacity of the pipe behind chunked responses of unknown length.
    pub chunk_buffer_size: usize,
    /// Requested byte ranges closer than this are served as one range.
    pub range_join_gap: u64,
    pub server_name: String,
    pub websocket: WebSocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            tick_interval: Duration::from_millis(20),
            max_accepts_per_tick: 10,
            keep_alive_timeout: Duration::from_secs(30),
            first_byte_timeout: Duration::from_secs(5),
            read_buffer_size: 8 * 1024,
            max_header_bytes: 8 * 1024,
            max_header_count: 64,
            chunk_buffer_size: 8 * 1024,
            range_join_gap: 80,
            server_name: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder { config: ServerConfig::default() }
    }
}

/// Consuming builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn address(mut self, address: impl Into<SocketAddr>) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.config.tick_interval = tick_interval;
        self
    }

    pub fn max_accepts_per_tick(mut self, max_accepts_per_tick: usize) -> Self {
        self.config.max_accepts_per_tick = max_accepts_per_tick.max(1);
        self
    }

    pub fn keep_alive_timeout(mut self, keep_alive_timeout: Duration) -> Self {
        self.config.keep_alive_timeout = keep_alive_timeout;
        self
    }

    pub fn first_byte_timeout(mut self, first_byte_timeout: Duration) -> Self {
        self.config.first_byte_timeout = first_byte_timeout;
        self
    }

    pub fn read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.config.read_buffer_size = read_buffer_size;
        self
    }

    pub fn max_header_bytes(mut self, max_header_bytes: usize) -> Self {
        self.config.max_header_bytes = max_header_bytes;
        self
    }

    pub fn max_header_count(mut self, max_header_count: usize) -> Self {
        self.config.max_header_count = max_header_count;
        self
    }

    pub fn chunk_buffer_size(mut self, chunk_buffer_size: usize) -> Self {
        self.config.chunk_buffer_size = chunk_buffer_size.max(1);
        self
    }

    pub fn range_join_gap(mut self, range_join_gap: u64) -> Self {
        self.config.range_join_gap = range_join_gap;
        self
    }

    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.config.server_name = server_name.into();
        self
    }

    pub fn websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.config.websocket = websocket;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Tunables of upgraded WebSocket connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Interval of unsolicited pings.
    pub ping_interval: Duration,
    /// Largest accepted frame payload and reassembled message.
    pub max_payload: usize,
    /// Close the connection when no pong arrived for this long. Disabled by default.
    pub pong_timeout: Option<Duration>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self { ping_interval: Duration::from_secs(10), max_payload: i32::MAX as usize, pong_timeout: None }
    }
}

impl WebSocketConfig {
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn pong_timeout(mut self, pong_timeout: Option<Duration>) -> Self {
        self.pong_timeout = pong_timeout;
        self
    }
}
