use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::{RelayError, Result},
    frame::Frame,
    session::SessionId,
};

/// Operation carried by every application message. Encoded as its numeric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Operation {
    Heartbeat = 0,
    Unicast = 1,
    Broadcast = 2,
}

impl From<Operation> for u8 {
    fn from(op: Operation) -> Self {
        op as u8
    }
}

impl TryFrom<u8> for Operation {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Operation::Heartbeat),
            1 => Ok(Operation::Unicast),
            2 => Ok(Operation::Broadcast),
            other => Err(format!("unknown operation {other}")),
        }
    }
}

/// A message as a client sends it.
///
/// `sender_id` is overwritten by the server with the identity of the session the
/// message arrived on; whatever the client put there is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub op: Operation,
    #[serde(default)]
    pub sender_id: SessionId,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub recipient_id: SessionId,
    #[serde(default)]
    pub body: String,
}

impl Envelope {
    pub fn heartbeat() -> Self {
        Self {
            op: Operation::Heartbeat,
            sender_id: SessionId::default(),
            sender_name: String::new(),
            recipient_id: SessionId::default(),
            body: String::new(),
        }
    }
}

/// A message as the server delivers it to a session's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    pub op: Operation,
    #[serde(default)]
    pub body: String,
}

impl Outbound {
    pub fn heartbeat() -> Self {
        Self {
            op: Operation::Heartbeat,
            body: String::new(),
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Serializes `message` and writes it as a single frame.
pub async fn write_framed<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    Frame::encode(encode(message)?)?.write_to(writer).await
}

/// Reads one frame and decodes its payload. `Ok(None)` on a clean end of stream.
pub async fn read_framed<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match Frame::decode(reader).await? {
        Some(frame) => Ok(Some(decode(frame.payload())?)),
        None => Ok(None),
    }
}

/// Parses a client input line of the form `[<recipient>] <text>`.
///
/// `<recipient>` is a numeric session identity for a private message or `*` for
/// a broadcast.
pub fn parse_command(sender_name: &str, line: &str) -> Result<Envelope> {
    let line = line.trim();
    let rest = line
        .strip_prefix('[')
        .ok_or_else(|| invalid("expected `[<recipient>] <text>`"))?;
    let (target, text) = rest
        .split_once(']')
        .ok_or_else(|| invalid("missing closing `]`"))?;
    let text = text.trim_start();
    if text.is_empty() {
        return Err(invalid("message text is empty"));
    }

    let (op, recipient_id) = match target.trim() {
        "*" => (Operation::Broadcast, SessionId::default()),
        id => {
            let id = id
                .parse::<u32>()
                .map_err(|_| invalid(&format!("invalid user id `{id}`")))?;
            (Operation::Unicast, SessionId::new(id))
        }
    };

    Ok(Envelope {
        op,
        sender_id: SessionId::default(),
        sender_name: sender_name.to_string(),
        recipient_id,
        body: text.to_string(),
    })
}

fn invalid(reason: &str) -> RelayError {
    RelayError::InvalidCommand(reason.to_string())
}
