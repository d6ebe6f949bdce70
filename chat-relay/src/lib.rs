//! Minimal real-time chat relay.
//!
//! Clients connect over a raw TCP socket speaking a small length-prefixed frame
//! protocol, or over a WebSocket at `/ws`, and exchange private or broadcast
//! text messages through the relay. Both transports feed one registry, so a TCP
//! client can message a WebSocket client and vice versa.
//!
//! - [`frame`] is the TCP wire framing, including the splitter that reassembles
//!   frames from an arbitrarily chunked byte stream.
//! - [`message`] holds the JSON application messages and the client's
//!   `[<recipient>] <text>` command syntax.
//! - [`session`] and [`registry`] track connected clients and their bounded
//!   outbound mailboxes.
//! - [`router`] delivers inbound messages to one mailbox or all of them.
//! - [`transport`] runs the per-session reader and writer loops on top of the
//!   TCP and WebSocket capabilities.
//! - [`server`] accepts connections on both listeners; [`client`] is the
//!   terminal client; [`cli`] and [`config`] describe how both are configured.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;
