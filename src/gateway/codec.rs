use crate::error::{ProtocolError, Result, StateError};
use flate2::{Decompress, FlushDecompress};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::sync::Arc;

/// Sync-flush marker terminating one logical message in the zlib stream.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
    #[serde(other)]
    Unknown = 255,
}

impl Opcode {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "DISPATCH",
            Self::Heartbeat => "HEARTBEAT",
            Self::Identify => "IDENTIFY",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
            Self::VoiceStateUpdate => "VOICE_STATE_UPDATE",
            Self::Resume => "RESUME",
            Self::Reconnect => "RECONNECT",
            Self::RequestGuildMembers => "REQUEST_GUILD_MEMBERS",
            Self::InvalidSession => "INVALID_SESSION",
            Self::Hello => "HELLO",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// One gateway payload: opcode, optional sequence, optional dispatch name,
/// and data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub op: Opcode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

impl Frame {
    pub fn new(op: Opcode, d: Value) -> Self {
        Self {
            op,
            s: None,
            t: None,
            d,
        }
    }
}

/// Alternate wire encoding, decoded by a pluggable codec.
pub trait TermCodec: Send + Sync {
    /// Value used for the `encoding` query parameter.
    fn name(&self) -> &'static str;
    fn decode(&self, bytes: &[u8]) -> Result<Frame>;
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    Term,
}

/// Message leaving the codec for the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Streaming zlib context. Frames accumulate until the raw stream ends with
/// [`ZLIB_SUFFIX`]; reset on every reconnect.
pub struct Inflater {
    decompress: Decompress,
    pending: Vec<u8>,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            pending: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.decompress.reset(true);
        self.pending.clear();
    }

    /// Feed one websocket frame; yields the inflated logical message once
    /// the suffix arrives, `None` while fragments are still outstanding.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>> {
        self.pending.extend_from_slice(chunk);
        if !self.pending.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(self.pending.len().saturating_mul(4));
        let mut consumed = 0usize;
        while consumed < self.pending.len() {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            out.reserve(8 * 1024);
            self.decompress
                .decompress_vec(&self.pending[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| ProtocolError::Inflate(e.to_string()))?;
            consumed += (self.decompress.total_in() - before_in) as usize;
            if self.decompress.total_in() == before_in && self.decompress.total_out() == before_out
            {
                break;
            }
        }
        self.pending.clear();
        Ok(Some(out))
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes and decodes gateway payloads for one connection.
pub struct FrameCodec {
    encoding: Encoding,
    term: Option<Arc<dyn TermCodec>>,
    inflater: Option<Inflater>,
}

impl FrameCodec {
    /// Fails when the alternate encoding is requested without a codec.
    pub fn new(
        encoding: Encoding,
        term: Option<Arc<dyn TermCodec>>,
        compress: bool,
    ) -> Result<Self> {
        if encoding == Encoding::Term && term.is_none() {
            return Err(StateError::MissingTermCodec.into());
        }
        Ok(Self {
            encoding,
            term,
            inflater: compress.then(Inflater::new),
        })
    }

    pub fn encoding_name(&self) -> &'static str {
        match (self.encoding, &self.term) {
            (Encoding::Json, _) => "json",
            (Encoding::Term, Some(codec)) => codec.name(),
            (Encoding::Term, None) => unreachable!("validated at construction"),
        }
    }

    pub const fn compressed(&self) -> bool {
        self.inflater.is_some()
    }

    /// Drop any half-assembled message; called on every reconnect.
    pub fn reset(&mut self) {
        if let Some(inflater) = &mut self.inflater {
            inflater.reset();
        }
    }

    pub fn decode_text(&self, text: &str) -> Result<Frame> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidFrame(e.to_string()).into())
    }

    /// `None` while a fragmented compressed message is incomplete.
    pub fn decode_binary(&mut self, bytes: &[u8]) -> Result<Option<Frame>> {
        let inflated;
        let payload: &[u8] = match &mut self.inflater {
            Some(inflater) => match inflater.push(bytes)? {
                Some(message) => {
                    inflated = message;
                    &inflated
                }
                None => return Ok(None),
            },
            None => bytes,
        };

        let frame = match (self.encoding, &self.term) {
            (Encoding::Json, _) => serde_json::from_slice(payload)
                .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?,
            (Encoding::Term, Some(codec)) => codec.decode(payload)?,
            (Encoding::Term, None) => unreachable!("validated at construction"),
        };
        Ok(Some(frame))
    }

    pub fn encode(&self, op: Opcode, d: Value) -> Result<WireMessage> {
        let frame = Frame::new(op, d);
        match (self.encoding, &self.term) {
            (Encoding::Json, _) => Ok(WireMessage::Text(serde_json::to_string(&frame)?)),
            (Encoding::Term, Some(codec)) => Ok(WireMessage::Binary(codec.encode(&frame)?)),
            (Encoding::Term, None) => unreachable!("validated at construction"),
        }
    }
}
