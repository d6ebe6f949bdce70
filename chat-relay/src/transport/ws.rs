use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async_with_config,
    tungstenite::{
        Error as WsError, Message,
        error::CapacityError,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        protocol::WebSocketConfig,
    },
};
use tracing::info;

use super::{FrameSink, FrameSource, SessionTasks, spawn_session};
use crate::{
    config::RelayConfig,
    error::{RelayError, Result},
    registry::Registry,
};

/// The only request path upgraded to a WebSocket.
pub const WS_PATH: &str = "/ws";

/// Protocol limits for accepted connections. Oversized messages are refused by
/// the protocol reader before they are buffered in full.
pub fn protocol_config(config: &RelayConfig) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(config.ws_max_message_size))
        .max_frame_size(Some(config.ws_max_message_size))
}

/// One text (or binary) WebSocket message per application message; control
/// frames are consumed silently but still count as traffic for the read deadline.
pub struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
    read_timeout: Duration,
}

impl<S> WsSource<S> {
    pub fn new(stream: SplitStream<WebSocketStream<S>>, config: &RelayConfig) -> Self {
        Self {
            stream,
            read_timeout: config.ws_read_timeout,
        }
    }
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            let next = timeout(self.read_timeout, self.stream.next())
                .await
                .map_err(|_| RelayError::ReadTimeout(self.read_timeout))?;

            let message = match next {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(WsError::Capacity(CapacityError::MessageTooLong { size, .. }))) => {
                    return Err(RelayError::MessageTooLarge(size));
                }
                Some(Err(err)) => return Err(err.into()),
            };

            match message {
                Message::Text(text) => return Ok(Some(Bytes::from(text))),
                Message::Binary(data) => return Ok(Some(data)),
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

pub struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsSink<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, payload: Bytes) -> Result<()> {
        let text = std::str::from_utf8(&payload)?.to_owned();
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn write_heartbeat(&mut self) -> Result<()> {
        self.sink.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == WS_PATH {
        return Ok(response);
    }

    let mut rejection = ErrorResponse::new(Some(format!(
        "no websocket endpoint at {}",
        request.uri().path()
    )));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

/// Completes the upgrade handshake on an accepted socket and registers the session.
pub async fn start_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    config: &RelayConfig,
) -> Result<SessionTasks> {
    let handshake = accept_hdr_async_with_config(stream, check_path, Some(protocol_config(config)));
    let websocket = timeout(config.ws_handshake_timeout, handshake)
        .await
        .map_err(|_| RelayError::ReadTimeout(config.ws_handshake_timeout))??;
    let (sink, source) = websocket.split();

    let tasks = spawn_session(
        registry,
        config,
        WsSource::new(source, config),
        WsSink::new(sink),
    )
    .await?;
    info!(session = %tasks.id, %peer, transport = "ws", "client connected");
    Ok(tasks)
}
