//! # Speech Recognition Wire Protocol
//!
//! Binary framing used on the WebSocket connection to the upstream speech
//! recognition backend.
//!
//! ## Frame Layout:
//! ```text
//! byte 0   version (4 bits)        | header size in 4-byte words (4 bits)
//! byte 1   message type (4 bits)   | flags (4 bits)
//! byte 2   serialization (4 bits)  | compression (4 bits)
//! byte 3   reserved (0)
//! [4 bytes big-endian i32 sequence number, when flags bit 0 is set]
//! [4 bytes big-endian u32 payload length, full requests and full server responses]
//! payload (gzip-compressed when compression = gzip)
//! ```
//!
//! ## Key Rust Concepts:
//! - **#[repr(u8)] enums**: Each nibble value maps to a typed variant
//! - **byteorder**: `WriteBytesExt` / `ReadBytesExt` for big-endian integers
//! - **Option<i32>**: A frame either carries a sequence number or it doesn't
//!
//! Flags bit 1, or a negative sequence number, marks the final packet of an utterance.
//! Acks and server errors carry no length; their payload is the rest of the frame.
//! An empty transcript is `Ok(String::new())`, never a `CodecError`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io::{Cursor, Read, Write};

pub const PROTOCOL_VERSION: u8 = 0b0001;
pub const HEADER_WORDS: u8 = 0b0001;

/// Message type nibble.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    FullClientRequest = 0b0001,
    AudioOnlyRequest = 0b0010,
    FullServerResponse = 0b1001,
    ServerAck = 0b1011,
    ServerError = 0b1111,
}

impl MessageType {
    fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0b0001 => Some(Self::FullClientRequest),
            0b0010 => Some(Self::AudioOnlyRequest),
            0b1001 => Some(Self::FullServerResponse),
            0b1011 => Some(Self::ServerAck),
            0b1111 => Some(Self::ServerError),
            _ => None,
        }
    }

    pub fn has_length_prefix(self) -> bool {
        !matches!(self, Self::ServerAck | Self::ServerError)
    }
}

/// Type-specific flags nibble.
///
/// Bit 0 says a sequence number follows the header, bit 1 marks the last packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceFlag {
    None = 0b0000,
    Positive = 0b0001,
    /// Last packet, no sequence number attached
    Last = 0b0010,
    /// Last packet carrying its (negative) sequence number
    NegativeSequence = 0b0011,
}

impl SequenceFlag {
    fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0b0000 => Some(Self::None),
            0b0001 => Some(Self::Positive),
            0b0010 => Some(Self::Last),
            0b0011 => Some(Self::NegativeSequence),
            _ => None,
        }
    }

    fn for_sequence(sequence: Option<i32>) -> Self {
        match sequence {
            None => Self::None,
            Some(n) if n < 0 => Self::NegativeSequence,
            Some(_) => Self::Positive,
        }
    }

    pub fn has_sequence(self) -> bool {
        self as u8 & 0b0001 != 0
    }

    pub fn is_last(self) -> bool {
        self as u8 & 0b0010 != 0
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    Raw = 0b0000,
    Json = 0b0001,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None = 0b0000,
    Gzip = 0b0001,
}

/// Errors raised while building or parsing frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame ended before a declared field or payload length
    Truncated { needed: usize, available: usize },
    UnsupportedVersion(u8),
    /// Unknown nibble values or an impossible header size
    Malformed(String),
    Compression(String),
    /// Payload declared JSON but could not be parsed
    InvalidJson(String),
    Serialize(String),
    PayloadTooLarge(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated { needed, available } => write!(
                f,
                "truncated frame: needed {} bytes, {} available",
                needed, available
            ),
            CodecError::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            CodecError::Malformed(msg) => write!(f, "malformed frame: {}", msg),
            CodecError::Compression(msg) => write!(f, "gzip error: {}", msg),
            CodecError::InvalidJson(msg) => write!(f, "invalid JSON payload: {}", msg),
            CodecError::Serialize(msg) => write!(f, "failed to serialize payload: {}", msg),
            CodecError::PayloadTooLarge(len) => write!(f, "payload of {} bytes is too large", len),
        }
    }
}

impl std::error::Error for CodecError {}

/// A decoded frame. `payload` is already decompressed.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message_type: MessageType,
    pub flags: SequenceFlag,
    pub serialization: Serialization,
    pub compression: Compression,
    pub sequence: Option<i32>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// True for the backend's final response of an utterance.
    pub fn is_last(&self) -> bool {
        self.flags.is_last() || self.sequence.is_some_and(|seq| seq < 0)
    }

    /// Extract the transcript text from a JSON payload.
    ///
    /// Accepted shapes, tried in order: `result.text`, `payload_msg.result.text`,
    /// and a bare string under `payload_msg`. None of them matching yields an
    /// empty string.
    pub fn transcript(&self) -> Result<String, CodecError> {
        if self.serialization != Serialization::Json || self.payload.is_empty() {
            return Ok(String::new());
        }
        let value: Value = serde_json::from_slice(&self.payload)
            .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
        Ok(extract_transcript(&value).unwrap_or_default().to_string())
    }

    /// Human readable message carried by a server-error frame.
    pub fn error_message(&self) -> String {
        if let Ok(value) = serde_json::from_slice::<Value>(&self.payload) {
            for key in ["message", "error"] {
                if let Some(text) = value.get(key).and_then(Value::as_str) {
                    return text.to_string();
                }
            }
        }
        String::from_utf8_lossy(&self.payload).trim().to_string()
    }
}

fn extract_transcript(value: &Value) -> Option<&str> {
    value
        .pointer("/result/text")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/payload_msg/result/text").and_then(Value::as_str))
        .or_else(|| value.get("payload_msg").and_then(Value::as_str))
}

/// Encode one frame.
///
/// ## Parameters:
/// - `message_type`: What kind of frame this is
/// - `sequence`: `Some(n)` attaches a sequence number (negative marks the last packet)
/// - `payload`: Raw payload bytes (JSON text or PCM)
/// - `compress`: Gzip the payload before writing its length
pub fn encode(
    message_type: MessageType,
    sequence: Option<i32>,
    payload: &[u8],
    compress: bool,
) -> Result<Vec<u8>, CodecError> {
    let serialization = match message_type {
        MessageType::AudioOnlyRequest => Serialization::Raw,
        _ => Serialization::Json,
    };
    let compression = if compress { Compression::Gzip } else { Compression::None };
    let flags = SequenceFlag::for_sequence(sequence);

    let body = if compress {
        gzip(payload)?
    } else {
        payload.to_vec()
    };

    let mut frame = Vec::with_capacity(12 + body.len());
    frame.push((PROTOCOL_VERSION << 4) | HEADER_WORDS);
    frame.push(((message_type as u8) << 4) | flags as u8);
    frame.push(((serialization as u8) << 4) | compression as u8);
    frame.push(0x00);

    // Writing into a Vec cannot fail, but the io::Result still has to go somewhere
    let io_err = |e: std::io::Error| CodecError::Malformed(e.to_string());
    if let Some(seq) = sequence {
        frame.write_i32::<BigEndian>(seq).map_err(io_err)?;
    }
    if message_type.has_length_prefix() {
        let len = u32::try_from(body.len()).map_err(|_| CodecError::PayloadTooLarge(body.len()))?;
        frame.write_u32::<BigEndian>(len).map_err(io_err)?;
    }
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Serialize `value` as JSON and encode it as one frame.
pub fn encode_json<T: Serialize>(
    message_type: MessageType,
    sequence: Option<i32>,
    value: &T,
    compress: bool,
) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
    encode(message_type, sequence, &payload, compress)
}

/// Decode one frame, decompressing the payload when needed.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::Truncated { needed: 4, available: bytes.len() });
    }

    let version = bytes[0] >> 4;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let header_len = usize::from(bytes[0] & 0x0F) * 4;
    if header_len == 0 {
        return Err(CodecError::Malformed("header size of zero words".to_string()));
    }
    if bytes.len() < header_len {
        return Err(CodecError::Truncated { needed: header_len, available: bytes.len() });
    }

    let message_type = MessageType::from_nibble(bytes[1] >> 4)
        .ok_or_else(|| CodecError::Malformed(format!("unknown message type {:#06b}", bytes[1] >> 4)))?;
    let flags = SequenceFlag::from_nibble(bytes[1] & 0x0F)
        .ok_or_else(|| CodecError::Malformed(format!("unknown flags {:#06b}", bytes[1] & 0x0F)))?;
    let serialization = match bytes[2] >> 4 {
        0b0000 => Serialization::Raw,
        0b0001 => Serialization::Json,
        other => return Err(CodecError::Malformed(format!("unknown serialization {:#06b}", other))),
    };
    let compression = match bytes[2] & 0x0F {
        0b0000 => Compression::None,
        0b0001 => Compression::Gzip,
        other => return Err(CodecError::Malformed(format!("unknown compression {:#06b}", other))),
    };

    let mut cursor = Cursor::new(&bytes[header_len..]);
    let remaining = |cursor: &Cursor<&[u8]>| cursor.get_ref().len() - cursor.position() as usize;

    let sequence = if !flags.has_sequence() {
        None
    } else {
        let available = remaining(&cursor);
        Some(
            cursor
                .read_i32::<BigEndian>()
                .map_err(|_| CodecError::Truncated { needed: 4, available })?,
        )
    };

    let body = if message_type.has_length_prefix() {
        let available = remaining(&cursor);
        let declared = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| CodecError::Truncated { needed: 4, available })? as usize;
        let available = remaining(&cursor);
        if declared > available {
            return Err(CodecError::Truncated { needed: declared, available });
        }
        let start = cursor.position() as usize;
        &cursor.get_ref()[start..start + declared]
    } else {
        let start = cursor.position() as usize;
        &cursor.get_ref()[start..]
    };

    let payload = match compression {
        Compression::Gzip if !body.is_empty() => gunzip(body)?,
        _ => body.to_vec(),
    };

    Ok(Frame {
        message_type,
        flags,
        serialization,
        compression,
        sequence,
        payload,
    })
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| CodecError::Compression(e.to_string()))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    Ok(out)
}

/// Hands out sequence numbers for one backend connection.
///
/// Numbers start at 1 and grow by one per frame. The final audio packet is
/// sent with the negated number so its magnitude keeps the progression.
#[derive(Debug)]
pub struct FrameSequencer {
    next: i32,
}

impl Default for FrameSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSequencer {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    fn advance(&mut self) -> i32 {
        let seq = self.next;
        self.next += 1;
        seq
    }

    /// Gzip-compressed JSON full client request (session configuration).
    pub fn full_request<T: Serialize>(&mut self, body: &T) -> Result<Vec<u8>, CodecError> {
        let seq = self.advance();
        encode_json(MessageType::FullClientRequest, Some(seq), body, true)
    }

    /// One audio-only packet; `last` marks the end of the utterance.
    pub fn audio(&mut self, chunk: &[u8], last: bool) -> Result<Vec<u8>, CodecError> {
        let seq = self.advance();
        let seq = if last { -seq } else { seq };
        encode(MessageType::AudioOnlyRequest, Some(seq), chunk, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL_TYPES: [MessageType; 5] = [
        MessageType::FullClientRequest,
        MessageType::AudioOnlyRequest,
        MessageType::FullServerResponse,
        MessageType::ServerAck,
        MessageType::ServerError,
    ];

    #[test]
    fn test_round_trip_preserves_type_sequence_and_payload() {
        let payload = br#"{"result":{"text":"hello"}}"#;
        for message_type in ALL_TYPES {
            for sequence in [None, Some(1), Some(42), Some(-7)] {
                for compress in [false, true] {
                    let bytes = encode(message_type, sequence, payload, compress).unwrap();
                    let frame = decode(&bytes).unwrap();
                    assert_eq!(frame.message_type, message_type);
                    assert_eq!(frame.sequence, sequence);
                    assert_eq!(frame.payload, payload.to_vec());
                }
            }
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(MessageType::FullClientRequest, Some(1), b"{}", false).unwrap();
        assert_eq!(bytes[0], 0x11);
        assert_eq!(bytes[1], 0x11);
        assert_eq!(bytes[2], 0x10);
        assert_eq!(bytes[3], 0x00);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 1]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 2]);
        assert_eq!(&bytes[12..], b"{}");
    }

    #[test]
    fn test_declared_length_matches_compressed_payload() {
        let payload = vec![7u8; 4096];
        let bytes = encode(MessageType::FullServerResponse, None, &payload, true).unwrap();
        let declared = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        assert_eq!(declared, bytes.len() - 8);
        assert!(declared < payload.len());
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut bytes = encode(MessageType::FullServerResponse, Some(3), b"{\"a\":1}", false).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(decode(&bytes), Err(CodecError::Truncated { .. })));
        assert!(matches!(decode(&[0x11, 0x90]), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_unknown_nibbles_are_malformed() {
        assert!(matches!(decode(&[0x11, 0x30, 0x10, 0x00]), Err(CodecError::Malformed(_))));
        assert!(matches!(decode(&[0x21, 0x90, 0x10, 0x00]), Err(CodecError::UnsupportedVersion(2))));
        assert!(matches!(decode(&[0x10, 0x90, 0x10, 0x00]), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_extended_header_is_skipped() {
        let mut bytes = encode(MessageType::FullServerResponse, None, b"{}", false).unwrap();
        bytes[0] = (PROTOCOL_VERSION << 4) | 0b0010;
        bytes.splice(4..4, [0xAA, 0xBB, 0xCC, 0xDD]);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.payload, b"{}".to_vec());
    }

    #[test]
    fn test_transcript_shapes_in_order() {
        let frame_for = |value: serde_json::Value| {
            decode(&encode_json(MessageType::FullServerResponse, None, &value, true).unwrap()).unwrap()
        };

        let direct = frame_for(json!({"result": {"text": "first"}, "payload_msg": "third"}));
        assert_eq!(direct.transcript().unwrap(), "first");

        let nested = frame_for(json!({"payload_msg": {"result": {"text": "second"}}}));
        assert_eq!(nested.transcript().unwrap(), "second");

        let bare = frame_for(json!({"payload_msg": "third"}));
        assert_eq!(bare.transcript().unwrap(), "third");

        let none = frame_for(json!({"code": 1000}));
        assert_eq!(none.transcript().unwrap(), "");
    }

    #[test]
    fn test_invalid_json_is_distinct_from_empty_transcript() {
        let frame = decode(&encode(MessageType::FullServerResponse, None, b"not json", false).unwrap()).unwrap();
        assert!(matches!(frame.transcript(), Err(CodecError::InvalidJson(_))));
    }

    #[test]
    fn test_server_error_message() {
        let bytes = encode_json(
            MessageType::ServerError,
            None,
            &json!({"message": "quota exceeded"}),
            false,
        )
        .unwrap();
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.message_type, MessageType::ServerError);
        assert_eq!(frame.error_message(), "quota exceeded");
    }

    #[test]
    fn test_last_response_without_sequence() {
        let payload = br#"{"result":{"text":"final words"}}"#;
        let mut bytes = vec![0x11, 0x92, 0x10, 0x00];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);

        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.flags, SequenceFlag::Last);
        assert_eq!(frame.sequence, None);
        assert!(frame.is_last());
        assert_eq!(frame.transcript().unwrap(), "final words");
    }

    #[test]
    fn test_server_error_payload_is_rest_of_frame() {
        let mut bytes = vec![0x11, 0xF0, 0x10, 0x00];
        bytes.extend_from_slice(br#"{"message":"quota exceeded"}"#);

        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.message_type, MessageType::ServerError);
        assert_eq!(frame.error_message(), "quota exceeded");
    }

    #[test]
    fn test_sequencer_is_monotonic_from_one() {
        let mut sequencer = FrameSequencer::new();
        let mut frames = vec![sequencer.full_request(&json!({"user": {"uid": "u"}})).unwrap()];
        for i in 0..4 {
            frames.push(sequencer.audio(&[0u8; 320], i == 3).unwrap());
        }

        let sequences: Vec<i32> = frames
            .iter()
            .map(|bytes| decode(bytes).unwrap().sequence.unwrap())
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, -5]);

        let last = decode(frames.last().unwrap()).unwrap();
        assert!(last.is_last());
        assert_eq!(last.serialization, Serialization::Raw);
    }

    #[test]
    fn test_negative_with_sequence_flag_is_read_as_last() {
        let mut bytes = encode(MessageType::FullServerResponse, Some(-3), b"{}", false).unwrap();
        bytes[1] = ((MessageType::FullServerResponse as u8) << 4) | 0b0011;
        let frame = decode(&bytes).unwrap();
        assert!(frame.is_last());
        assert_eq!(frame.sequence, Some(-3));
    }
}
