use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{
    DEFAULT_DELIVERY_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAILBOX_CAPACITY, RelayConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting raw TCP and WebSocket clients.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address for framed TCP clients. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8081")]
    pub tcp: SocketAddr,

    /// Address for WebSocket clients (served at `/ws`).
    #[arg(long, default_value = "127.0.0.1:8088")]
    pub ws: SocketAddr,

    #[arg(long, default_value_t = DEFAULT_MAILBOX_CAPACITY)]
    pub mailbox_capacity: usize,

    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_secs())]
    pub heartbeat_secs: u64,

    /// How long to wait on a recipient's full mailbox before dropping the message.
    #[arg(long, default_value_t = DEFAULT_DELIVERY_TIMEOUT.as_millis() as u64)]
    pub delivery_timeout_ms: u64,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            mailbox_capacity: self.mailbox_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            ..RelayConfig::default()
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Ws,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, value_enum, default_value_t = TransportKind::Tcp)]
    pub transport: TransportKind,

    /// Display name attached to outgoing messages.
    #[arg(long, default_value = "user")]
    pub name: String,

    /// Relay address; use the TCP port for `tcp` and the WebSocket port for `ws`.
    #[arg(long)]
    pub server: Option<SocketAddr>,
}

impl ClientArgs {
    pub fn server_addr(&self) -> SocketAddr {
        self.server.unwrap_or_else(|| match self.transport {
            TransportKind::Tcp => SocketAddr::from(([127, 0, 0, 1], 8081)),
            TransportKind::Ws => SocketAddr::from(([127, 0, 0, 1], 8088)),
        })
    }
}
