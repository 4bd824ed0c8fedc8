//! Wire protocol: the 4-byte connect handshake, then tagged messages in both
//! directions.
//!
//! Every message starts with a little-endian `i16` type tag:
//!
//! - `0` Winch: `width: i16`, `height: i16`
//! - `1` Data: `length: i32`, then exactly `length` bytes
//!
//! All integers are little-endian. Raw bytes are never sent after the
//! handshake; everything is framed.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

// ── Constants ────────────────────────────────────────────────────────

pub const MSG_WINCH: i16 = 0;
pub const MSG_DATA: i16 = 1;

pub const HANDSHAKE_LEN: usize = 4;

/// Upper bound on a decoded `Data` payload. A length field above this is
/// treated as a corrupt frame instead of an allocation request.
pub const MAX_DATA_LEN: usize = 16 * 1024 * 1024;

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecodeError {
    /// End-of-stream before the first byte of a message.
    #[error("stream closed")]
    Closed,

    #[error("truncated {what}: expected {expected} bytes, read only {read} ({} short)", .expected - .read)]
    Truncated {
        what: &'static str,
        expected: usize,
        read: usize,
    },

    #[error("unknown message type {0}")]
    UnknownType(i16),

    #[error("negative data length {0}")]
    NegativeLength(i32),

    #[error("data length {0} exceeds the {} byte limit", MAX_DATA_LEN)]
    Oversized(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// Bytes missing from a truncated frame, zero for every other error.
    pub fn short_by(&self) -> usize {
        match self {
            DecodeError::Truncated { expected, read, .. } => expected - read,
            _ => 0,
        }
    }
}

// ── Messages ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Winch,
    Data,
}

impl MessageType {
    pub fn raw(self) -> i16 {
        match self {
            MessageType::Winch => MSG_WINCH,
            MessageType::Data => MSG_DATA,
        }
    }
}

impl TryFrom<i16> for MessageType {
    type Error = DecodeError;

    fn try_from(raw: i16) -> Result<Self, Self::Error> {
        match raw {
            MSG_WINCH => Ok(MessageType::Winch),
            MSG_DATA => Ok(MessageType::Data),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// Terminal resize notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Winch {
    pub width: i16,
    pub height: i16,
}

/// A chunk of terminal bytes.
///
/// The declared length never exceeds the payload: whatever length a `Data`
/// was built with, the length written on the wire is the number of payload
/// bytes actually sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    payload: Vec<u8>,
    length: i32,
}

impl Data {
    /// Wraps `payload` whole. Decoders reject anything above
    /// [`MAX_DATA_LEN`], so bulk output goes through [`Message::data_frames`].
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let length = payload.len().min(i32::MAX as usize) as i32;
        Self { payload, length }
    }

    /// Builds a `Data` whose length field claims `length` bytes regardless of
    /// the payload size. Encoding clamps the claim to the real payload.
    pub fn with_declared_length(payload: impl Into<Vec<u8>>, length: i32) -> Self {
        Self {
            payload: payload.into(),
            length,
        }
    }

    /// Number of bytes this message carries on the wire.
    pub fn len(&self) -> usize {
        (self.length.max(0) as usize).min(self.payload.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len()]
    }

    pub fn into_payload(mut self) -> Vec<u8> {
        let len = self.len();
        self.payload.truncate(len);
        self.payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Winch(Winch),
    Data(Data),
}

impl Message {
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Message::Data(Data::new(payload))
    }

    pub fn winch(width: i16, height: i16) -> Self {
        Message::Winch(Winch { width, height })
    }

    /// Split `payload` into `Data` messages of at most [`MAX_DATA_LEN`]
    /// bytes each, in order. An empty payload yields nothing.
    pub fn data_frames(payload: &[u8]) -> impl Iterator<Item = Message> + '_ {
        payload.chunks(MAX_DATA_LEN).map(Message::data)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Winch(_) => MessageType::Winch,
            Message::Data(_) => MessageType::Data,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_type().raw().to_le_bytes());
        match self {
            Message::Winch(winch) => {
                buf.extend_from_slice(&winch.width.to_le_bytes());
                buf.extend_from_slice(&winch.height.to_le_bytes());
            }
            Message::Data(data) => {
                let payload = data.payload();
                buf.extend_from_slice(&(payload.len() as i32).to_le_bytes());
                buf.extend_from_slice(payload);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = match self {
            Message::Winch(_) => 4,
            Message::Data(data) => 4 + data.len(),
        };
        let mut buf = Vec::with_capacity(2 + body);
        self.encode_into(&mut buf);
        buf
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }
}

// ── Decoding ─────────────────────────────────────────────────────────

/// Read until `buf` is full or the stream ends. Returns the bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

async fn read_field<R>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), DecodeError>
where
    R: AsyncRead + Unpin,
{
    let read = read_full(reader, buf).await?;
    if read < buf.len() {
        return Err(DecodeError::Truncated {
            what,
            expected: buf.len(),
            read,
        });
    }
    Ok(())
}

/// Read the raw type tag of the next message.
///
/// End-of-stream before the first tag byte is [`DecodeError::Closed`]; a
/// stream that ends between the two tag bytes is a truncated frame.
pub async fn read_message_type<R>(reader: &mut R) -> Result<i16, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 2];
    match read_full(reader, &mut tag).await? {
        0 => Err(DecodeError::Closed),
        2 => Ok(i16::from_le_bytes(tag)),
        read => Err(DecodeError::Truncated {
            what: "message type",
            expected: 2,
            read,
        }),
    }
}

/// Decode the body of a message whose tag has already been read.
pub async fn decode_body<R>(kind: MessageType, reader: &mut R) -> Result<Message, DecodeError>
where
    R: AsyncRead + Unpin,
{
    match kind {
        MessageType::Winch => {
            let mut body = [0u8; 4];
            read_field(reader, &mut body, "winch").await?;
            Ok(Message::winch(
                i16::from_le_bytes([body[0], body[1]]),
                i16::from_le_bytes([body[2], body[3]]),
            ))
        }
        MessageType::Data => {
            let mut len = [0u8; 4];
            read_field(reader, &mut len, "data length").await?;
            let length = i32::from_le_bytes(len);
            if length < 0 {
                return Err(DecodeError::NegativeLength(length));
            }
            let expected = length as usize;
            if expected > MAX_DATA_LEN {
                return Err(DecodeError::Oversized(expected));
            }

            let mut payload = Vec::with_capacity(expected.min(64 * 1024));
            let read = reader.take(expected as u64).read_to_end(&mut payload).await?;
            if read < expected {
                return Err(DecodeError::Truncated {
                    what: "data payload",
                    expected,
                    read,
                });
            }
            Ok(Message::Data(Data::new(payload)))
        }
    }
}

/// Decode exactly one message from the stream.
pub async fn decode_one<R>(reader: &mut R) -> Result<Message, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let raw = read_message_type(reader).await?;
    decode_body(MessageType::try_from(raw)?, reader).await
}

// ── Dispatch ─────────────────────────────────────────────────────────

/// How a dispatch loop ended.
#[derive(Debug)]
pub enum StreamEnd {
    /// The peer closed the stream between messages.
    Closed,
    /// A decode, I/O or handler error stopped the loop.
    Failed(ProxyError),
}

impl StreamEnd {
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamEnd::Closed)
    }
}

pub trait MessageHandler {
    /// Sees the raw type value of every message before it is decoded.
    fn on_message_type(&mut self, _raw: i16) {}

    fn on_winch(&mut self, winch: Winch) -> Result<(), ProxyError>;

    fn on_data(&mut self, data: Data) -> Result<(), ProxyError>;

    /// Called exactly once, with the condition that ended the loop.
    fn on_end(&mut self, _end: &StreamEnd) {}
}

/// Decode and dispatch messages until the stream ends or fails.
///
/// The terminal condition is handed to [`MessageHandler::on_end`] and
/// returned.
pub async fn run_dispatch_loop<R, H>(reader: &mut R, handler: &mut H) -> StreamEnd
where
    R: AsyncRead + Unpin,
    H: MessageHandler,
{
    let end = loop {
        let raw = match read_message_type(reader).await {
            Ok(raw) => raw,
            Err(err) => break stream_end(err),
        };
        handler.on_message_type(raw);

        let decoded = match MessageType::try_from(raw) {
            Ok(kind) => decode_body(kind, reader).await,
            Err(err) => Err(err),
        };
        let handled = match decoded {
            Ok(Message::Winch(winch)) => handler.on_winch(winch),
            Ok(Message::Data(data)) => handler.on_data(data),
            Err(err) => break stream_end(err),
        };
        if let Err(err) = handled {
            break StreamEnd::Failed(err);
        }
    };
    handler.on_end(&end);
    end
}

fn stream_end(err: DecodeError) -> StreamEnd {
    match err {
        DecodeError::Closed => StreamEnd::Closed,
        other => StreamEnd::Failed(other.into()),
    }
}

// ── Handshake ────────────────────────────────────────────────────────

/// The size frame a client sends once, right after connecting.
///
/// Layout: `heightLow, heightHigh, widthLow, widthHigh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub rows: u16,
    pub cols: u16,
}

impl Handshake {
    pub fn to_bytes(self) -> [u8; HANDSHAKE_LEN] {
        let [h0, h1] = self.rows.to_le_bytes();
        let [w0, w1] = self.cols.to_le_bytes();
        [h0, h1, w0, w1]
    }

    pub fn from_bytes(bytes: [u8; HANDSHAKE_LEN]) -> Self {
        Self {
            rows: u16::from_le_bytes([bytes[0], bytes[1]]),
            cols: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        let read = read_full(reader, &mut bytes)
            .await
            .map_err(ProxyError::ConnectionIo)?;
        if read != HANDSHAKE_LEN {
            return Err(ProxyError::Handshake(format!(
                "expected {HANDSHAKE_LEN} size bytes, read {read}"
            )));
        }
        Ok(Self::from_bytes(bytes))
    }

    pub async fn write_to<W>(self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
