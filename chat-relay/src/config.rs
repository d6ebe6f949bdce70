use std::time::Duration;

/// Outbound messages a session can have queued before senders wait.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WS_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_WS_MAX_MESSAGE_SIZE: usize = 2048;

/// Tunables shared by both listeners.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub mailbox_capacity: usize,
    /// Period of the writer's heartbeat frame (TCP) or ping (WebSocket), sent regardless of traffic.
    pub heartbeat_interval: Duration,
    /// How long a router waits on a full mailbox before dropping that copy.
    pub delivery_timeout: Duration,
    pub write_timeout: Duration,
    /// Time an accepted socket gets to complete the WebSocket upgrade.
    pub ws_handshake_timeout: Duration,
    /// A WebSocket peer that sends nothing (pongs included) for this long is dropped.
    pub ws_read_timeout: Duration,
    /// Largest WebSocket message accepted from a client, enforced while reading.
    pub ws_max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ws_handshake_timeout: DEFAULT_WS_HANDSHAKE_TIMEOUT,
            ws_read_timeout: DEFAULT_WS_READ_TIMEOUT,
            ws_max_message_size: DEFAULT_WS_MAX_MESSAGE_SIZE,
        }
    }
}
