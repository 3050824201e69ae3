//! # sockudo-ws-client: background-driven WebSocket client engine
//!
//! An RFC 6455 client where each connection is driven by its own tokio task.
//! The application configures a [`Connection`], registers callbacks, calls
//! [`Connection::connect`] and from then on only enqueues sends and reads
//! status. The worker task takes care of:
//!
//! - **Connect with retry**: a bounded number of attempts with a fixed delay
//! - **Handshake**: HTTP/1.1 upgrade with accept-key verification
//! - **Framing**: masked outbound frames, inbound decoding with reassembly
//! - **Keep-alive**: periodic pings while the connection is idle
//! - **Adaptive polling**: the idle poll interval backs off and snaps back
//!   on traffic
//!
//! ## Example
//!
//! ```ignore
//! use sockudo_ws_client::{Config, Connection};
//!
//! let conn = Connection::new(Config::default());
//! conn.set_url("ws://127.0.0.1:9001/echo")?;
//! conn.on_text(|_conn, text, _len| println!("got {text}"));
//! conn.on_disconnected(|conn| println!("closed: {:?}", conn.error()));
//! conn.connect()?;
//! conn.send_text("hello")?;
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod protocol;
pub mod queue;
pub mod state;
pub mod transport;

mod worker;

use std::time::Duration;

pub use client::Connection;
pub use error::{ConnectionError, Error, ErrorCode, Result};
pub use frame::{FragmentMarker, Frame, OpCode, Received};
pub use handshake::Scheme;
pub use state::State;
pub use transport::{DefaultTransport, TcpTransport, Transport};

#[cfg(feature = "tls")]
pub use transport::TlsTransport;

/// Default receive buffer size
pub const RECV_BUFFER_SIZE: usize = 8 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload that fits the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload that fits the 16-bit length field
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Message ids wrap back to zero at this value
pub const MESSAGE_ID_MODULUS: u32 = 10_000_000;

/// How binary messages reach the `on_binary` callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryDelivery {
    /// Deliver each frame as it arrives, tagged with its position
    #[default]
    Streaming,
    /// Reassemble the whole message first and deliver it once
    Buffered,
}

/// Connection engine configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sockudo_ws_client::{BinaryDelivery, Config};
///
/// let config = Config::builder()
///     .connect_attempts(3)
///     .ping_interval(Duration::from_secs(5))
///     .binary_delivery(BinaryDelivery::Buffered)
///     .build();
/// assert_eq!(config.connect_attempts, 3);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Connect attempts before giving up (default: 5)
    pub connect_attempts: u32,
    /// Delay between connect attempts (default: 200ms)
    pub connect_retry_delay: Duration,
    /// Poll interval right after activity (default: 5ms)
    pub min_poll_interval: Duration,
    /// Poll interval cap when idle (default: 100ms)
    pub max_poll_interval: Duration,
    /// How long a single transport read may wait (default: 10ms)
    pub read_timeout: Duration,
    /// How long a single frame write may take before the connection fails (default: 5s)
    pub write_timeout: Duration,
    /// How long to wait for the upgrade response (default: 10s)
    pub handshake_timeout: Duration,
    /// Wait after sending Close before tearing down (default: 200ms)
    pub close_grace: Duration,
    /// Send keep-alive pings (default: true)
    pub auto_ping: bool,
    /// Keep-alive ping interval (default: 20s)
    pub ping_interval: Duration,
    /// Fail the connection if a ping goes unanswered this long (default: off)
    pub pong_timeout: Option<Duration>,
    /// Binary delivery mode (default: streaming)
    pub binary_delivery: BinaryDelivery,
    /// Check Sec-WebSocket-Accept against the sent key (default: true)
    pub verify_accept_key: bool,
    /// Sec-WebSocket-Protocol request header (default: none)
    pub subprotocol: Option<String>,
    /// Largest frame or buffered message accepted (default: 16MB)
    pub max_message_size: usize,
    /// Initial receive buffer capacity (default: 8KB)
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_retry_delay: Duration::from_millis(200),
            min_poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(100),
            read_timeout: Duration::from_millis(10),
            write_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            close_grace: Duration::from_millis(200),
            auto_ping: true,
            ping_interval: Duration::from_secs(20),
            pong_timeout: None,
            binary_delivery: BinaryDelivery::Streaming,
            verify_accept_key: true,
            subprotocol: None,
            max_message_size: 16 * 1024 * 1024,
            recv_buffer_size: RECV_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the number of connect attempts
    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.config.connect_attempts = attempts;
        self
    }

    /// Set the delay between connect attempts
    pub fn connect_retry_delay(mut self, delay: Duration) -> Self {
        self.config.connect_retry_delay = delay;
        self
    }

    /// Set the idle poll interval bounds
    pub fn poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_poll_interval = min;
        self.config.max_poll_interval = max;
        self
    }

    /// Set the transport read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set the per-write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Set the upgrade response timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the grace delay after sending Close
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.config.close_grace = grace;
        self
    }

    /// Enable or disable auto ping
    pub fn auto_ping(mut self, enabled: bool) -> Self {
        self.config.auto_ping = enabled;
        self
    }

    /// Set ping interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Fail the connection when a ping is not answered within `timeout`
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.config.pong_timeout = Some(timeout);
        self
    }

    /// Set binary delivery mode
    pub fn binary_delivery(mut self, mode: BinaryDelivery) -> Self {
        self.config.binary_delivery = mode;
        self
    }

    /// Enable or disable accept-key verification
    pub fn verify_accept_key(mut self, enabled: bool) -> Self {
        self.config.verify_accept_key = enabled;
        self
    }

    /// Request a subprotocol
    pub fn subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.subprotocol = Some(protocol.into());
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set initial receive buffer capacity
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.config.recv_buffer_size = size;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::Connection;
    pub use crate::error::{ConnectionError, Error, ErrorCode, Result};
    pub use crate::frame::{FragmentMarker, OpCode};
    pub use crate::state::State;
    pub use crate::{BinaryDelivery, Config};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.connect_attempts, 5);
        assert_eq!(config.connect_retry_delay, Duration::from_millis(200));
        assert_eq!(config.min_poll_interval, Duration::from_millis(5));
        assert_eq!(config.max_poll_interval, Duration::from_millis(100));
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.pong_timeout, None);
        assert_eq!(config.binary_delivery, BinaryDelivery::Streaming);
        assert!(config.verify_accept_key);
        assert!(config.subprotocol.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .auto_ping(false)
            .pong_timeout(Duration::from_secs(3))
            .subprotocol("chat")
            .write_timeout(Duration::from_millis(250))
            .poll_interval(Duration::from_millis(1), Duration::from_millis(8))
            .build();
        assert!(!config.auto_ping);
        assert_eq!(config.pong_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.subprotocol.as_deref(), Some("chat"));
        assert_eq!(config.max_poll_interval, Duration::from_millis(8));
        assert_eq!(config.write_timeout, Duration::from_millis(250));
    }
}
