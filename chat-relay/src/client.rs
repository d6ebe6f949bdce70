use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    task::JoinHandle,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::{
    cli::{ClientArgs, TransportKind},
    message::{self, Envelope, Operation, Outbound, parse_command, read_framed, write_framed},
    transport::ws::WS_PATH,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let addr = args.server_addr();
    let (mut uplink, downlink) = match args.transport {
        TransportKind::Tcp => connect_tcp(addr).await?,
        TransportKind::Ws => connect_ws(addr).await?,
    };
    write_stdout(&format!("*** connected to {addr}")).await?;

    let mut printer = tokio::spawn(print_incoming(downlink));
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&args.name, &mut uplink, &mut printer, &mut stdin, &mut input).await?;
    uplink.close().await;
    printer.abort();

    Ok(())
}

async fn connect_tcp(addr: SocketAddr) -> Result<(Uplink, Downlink)> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    info!("connected to {addr} over tcp");

    let (reader, writer) = stream.into_split();
    Ok((Uplink::Tcp(writer), Downlink::Tcp(BufReader::new(reader))))
}

async fn connect_ws(addr: SocketAddr) -> Result<(Uplink, Downlink)> {
    let url = format!("ws://{addr}{WS_PATH}");
    let (websocket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!("connected to {url}");

    let (sink, stream) = websocket.split();
    Ok((Uplink::Ws(sink), Downlink::Ws(stream)))
}

/// Client-to-relay half of the connection.
enum Uplink {
    Tcp(OwnedWriteHalf),
    Ws(SplitSink<WsStream, Message>),
}

impl Uplink {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        match self {
            Uplink::Tcp(writer) => write_framed(writer, envelope).await?,
            Uplink::Ws(sink) => {
                let text = String::from_utf8(message::encode(envelope)?)?;
                sink.send(Message::Text(text.into())).await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        let result = match self {
            Uplink::Tcp(writer) => writer.shutdown().await.map_err(anyhow::Error::from),
            Uplink::Ws(sink) => sink.close().await.map_err(anyhow::Error::from),
        };
        if let Err(error) = result {
            warn!(?error, "failed to shutdown client connection cleanly");
        }
    }
}

/// Relay-to-client half of the connection.
enum Downlink {
    Tcp(BufReader<OwnedReadHalf>),
    Ws(SplitStream<WsStream>),
}

impl Downlink {
    async fn next(&mut self) -> Result<Option<Outbound>> {
        match self {
            Downlink::Tcp(reader) => Ok(read_framed(reader).await?),
            Downlink::Ws(stream) => loop {
                let incoming = match stream.next().await {
                    Some(incoming) => incoming?,
                    None => return Ok(None),
                };
                match incoming {
                    Message::Text(text) => return Ok(Some(message::decode(text.as_bytes())?)),
                    Message::Binary(data) => return Ok(Some(message::decode(&data)?)),
                    Message::Close(_) => return Ok(None),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                }
            },
        }
    }
}

async fn print_incoming(mut downlink: Downlink) -> Result<()> {
    while let Some(outbound) = downlink.next().await? {
        if outbound.op == Operation::Heartbeat {
            continue;
        }
        write_stdout(&outbound.body).await?;
    }
    write_stdout("*** server closed the connection").await?;
    Ok(())
}

async fn run_client_loop(
    name: &str,
    uplink: &mut Uplink,
    printer: &mut JoinHandle<Result<()>>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            printed = &mut *printer => {
                if let Ok(Err(error)) = printed {
                    write_stderr(&format!("!!! connection lost: {error}")).await?;
                }
                break;
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, name, uplink).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    name: &str,
    uplink: &mut Uplink,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    match parse_command(name, text) {
        Ok(envelope) => uplink.send(&envelope).await?,
        Err(error) => write_stderr(&format!("!!! {error}")).await?,
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
