//! Signaling Protocol
//!
//! Defines the message format exchanged between clients and the relay,
//! and the length-prefixed framing used on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest signaling frame accepted on either side (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message too large ({0} bytes)")]
    TooLarge(usize),
}

/// Opaque connection-setup blob produced and consumed by the negotiation engine.
///
/// The relay never looks inside. Clients only peek at the `type` field to tell
/// an offer apart from trickled candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signal(pub Value);

impl Signal {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Whether this blob opens a negotiation
    pub fn is_offer(&self) -> bool {
        self.kind() == Some("offer")
    }

    /// The `type` field of the blob, if it carries one
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// Serialized size, used for logging only
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(0)
    }
}

/// Messages sent by a client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    CallUser {
        user_to_call: String,
        signal_data: Signal,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    AnswerCall {
        signal: Signal,
        to: String,
    },
    SendFeedback {
        text: String,
    },
}

/// Messages sent by the relay to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The peer id assigned to this connection
    Me { id: String },
    /// A call-initiation signal forwarded from another peer
    CallUser {
        signal: Signal,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// An answer-side signal forwarded from the callee
    CallAccepted { signal: Signal },
    /// The addressed peer has no live connection
    #[serde(rename_all = "camelCase")]
    UserUnavailable { user_to_call: String },
    /// Some other session went away.
    ///
    /// Broadcast to every remaining session; `id` names the departed peer so
    /// clients can ignore departures unrelated to their own call.
    CallEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ServerMessage {
    /// Short event name, for logs
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Me { .. } => "me",
            ServerMessage::CallUser { .. } => "callUser",
            ServerMessage::CallAccepted { .. } => "callAccepted",
            ServerMessage::UserUnavailable { .. } => "userUnavailable",
            ServerMessage::CallEnded { .. } => "callEnded",
        }
    }
}

/// Prefix a payload with its length (4 bytes, big-endian)
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u32).to_be_bytes();
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len);
    framed.extend_from_slice(payload);
    framed
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream before a new frame starts.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended inside a length prefix ({} of 4 bytes)", filled),
            )
            .into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(ProtocolError::TooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize and send a message
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let data = serde_json::to_vec(message)?;
    write_frame(writer, &data).await
}

/// Receive and deserialize a message, `Ok(None)` once the peer has closed
pub async fn read_message<R, M>(reader: &mut R) -> Result<Option<M>, ProtocolError>
where
    R: AsyncRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    match read_frame(reader, MAX_MESSAGE_SIZE).await? {
        Some(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
        None => Ok(None),
    }
}
