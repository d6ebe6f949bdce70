use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::info;

use super::{FrameSink, FrameSource, SessionTasks, spawn_session};
use crate::{
    config::RelayConfig,
    error::Result,
    frame::{Frame, FrameSplitter},
    message::{self, Outbound},
    registry::Registry,
};

const READ_CHUNK: usize = 4 * 1024;

/// Reads frames off a byte stream, reassembling them however the bytes arrive.
#[derive(Debug)]
pub struct TcpSource<R> {
    reader: R,
    splitter: FrameSplitter,
    at_eof: bool,
}

impl<R> TcpSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            splitter: FrameSplitter::new(),
            at_eof: false,
        }
    }
}

#[async_trait]
impl<R> FrameSource for TcpSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            // After end of stream every call rescans what is left: an empty buffer
            // is a clean close, a partial frame is reported as malformed again.
            if let Some(frame) = self.splitter.split(self.at_eof)? {
                return Ok(Some(frame.into_payload()));
            }
            if self.at_eof {
                return Ok(None);
            }

            let read = self.reader.read(&mut chunk).await?;
            if read == 0 {
                self.at_eof = true;
            } else {
                self.splitter.extend(&chunk[..read]);
            }
        }
    }
}

#[derive(Debug)]
pub struct TcpSink<W> {
    writer: W,
}

impl<W> TcpSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> FrameSink for TcpSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, payload: Bytes) -> Result<()> {
        Frame::encode(payload)?.write_to(&mut self.writer).await
    }

    async fn write_heartbeat(&mut self) -> Result<()> {
        let payload = message::encode(&Outbound::heartbeat())?;
        self.write_frame(payload.into()).await
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

pub fn split(stream: TcpStream) -> (TcpSource<OwnedReadHalf>, TcpSink<OwnedWriteHalf>) {
    let (reader, writer) = stream.into_split();
    (TcpSource::new(reader), TcpSink::new(writer))
}

/// Turns an accepted socket into a registered session.
pub async fn start_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    config: &RelayConfig,
) -> Result<SessionTasks> {
    let (source, sink) = split(stream);
    let tasks = spawn_session(registry, config, source, sink).await?;
    info!(session = %tasks.id, %peer, transport = "tcp", "client connected");
    Ok(tasks)
}
