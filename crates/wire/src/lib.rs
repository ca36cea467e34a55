//! Furlong Wire Protocol Types
//!
//! Shared frame types used between the broadcast fabric and subscribers.
//! Both the server and any native client depend on this crate so the two
//! sides cannot drift apart.
//!
//! # Frame contract
//!
//! Every sequenced frame (`race:start`, `race:tick`, `race:keyframe`,
//! `race:delta`, `race:finish`) carries a per-race monotone `seq` starting
//! at 1, the authoritative `tickIndex` where applicable, `tickTs` in epoch
//! milliseconds, and `protoVer`. Subscribers drop frames whose `seq` is not
//! greater than the last accepted one.
//!
//! # Encodings
//!
//! - Text: one JSON object per message, tagged by `type`.
//! - Binary (negotiated at connect): a JSON header, a newline, then the
//!   frame's position array packed as little-endian `f32`. Only
//!   position-bearing frames have a binary form; everything else stays text.
//!
//! Signing (see [`sign`]) covers the canonical JSON bytes of the message as
//! transmitted: the full frame for text messages, the header for binary
//! messages (the packed f32 array is a lossy rendering of the already
//! authoritative tick data and is excluded from the signature).

#![deny(unsafe_code)]

pub mod sign;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use furlong_sim::{HorseSeed, RaceConfig, Tick};

pub use sign::{FrameSigner, SignError};

/// Wire protocol version carried in every frame.
pub const PROTO_VER: u32 = 1;

/// Sequence number type: monotone per race, starting at 1.
pub type Seq = u64;

// ============================================================================
// Server → Client Frames
// ============================================================================

/// One message emitted to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Connection greeting: what is currently running, if anything.
    #[serde(rename = "info")]
    #[serde(rename_all = "camelCase")]
    Info {
        race_id: Option<String>,
        config: Option<RaceConfig>,
        current_tick_index: Option<Tick>,
        proto_ver: u32,
    },

    /// Race start: field roster and configuration.
    #[serde(rename = "race:start")]
    #[serde(rename_all = "camelCase")]
    Start {
        seq: Seq,
        race_id: String,
        horses: Vec<HorseSeed>,
        config: RaceConfig,
        tick_ts: u64,
        proto_ver: u32,
    },

    /// Full position snapshot for one tick (plain mode).
    #[serde(rename = "race:tick")]
    #[serde(rename_all = "camelCase")]
    Tick {
        seq: Seq,
        race_id: String,
        tick_index: Tick,
        tick_ts: u64,
        positions: Vec<f64>,
        proto_ver: u32,
    },

    /// Self-sufficient snapshot anchoring subsequent deltas (delta mode).
    #[serde(rename = "race:keyframe")]
    #[serde(rename_all = "camelCase")]
    Keyframe {
        seq: Seq,
        race_id: String,
        tick_index: Tick,
        tick_ts: u64,
        positions: Vec<f64>,
        proto_ver: u32,
    },

    /// Per-horse position differences against the last keyframe.
    #[serde(rename = "race:delta")]
    #[serde(rename_all = "camelCase")]
    Delta {
        seq: Seq,
        race_id: String,
        tick_index: Tick,
        tick_ts: u64,
        /// Tick of the keyframe these deltas are relative to.
        keyframe_tick: Tick,
        deltas: Vec<f64>,
        proto_ver: u32,
    },

    /// Race end: winner and placements.
    #[serde(rename = "race:finish")]
    #[serde(rename_all = "camelCase")]
    Finish {
        seq: Seq,
        race_id: String,
        winner: String,
        placements: Vec<String>,
        tick_ts: u64,
        proto_ver: u32,
    },

    /// Bounded replay of recent ticks, served on request.
    #[serde(rename = "race:catchup")]
    #[serde(rename_all = "camelCase")]
    Catchup {
        race_id: String,
        start_index: Tick,
        /// Positions per tick, oldest first.
        ticks: Vec<Vec<f64>>,
        current_tick_index: Tick,
        proto_ver: u32,
    },

    /// Marks the end of a catch-up response.
    #[serde(rename = "race:sync-complete")]
    #[serde(rename_all = "camelCase")]
    SyncComplete {
        race_id: String,
        current_tick_index: Tick,
        proto_ver: u32,
    },

    /// Subscriber-visible error (bad sync request, unknown race).
    #[serde(rename = "error")]
    #[serde(rename_all = "camelCase")]
    Error { message: String, proto_ver: u32 },
}

/// Frame classification used by back-pressure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Info,
    Start,
    Tick,
    Keyframe,
    Delta,
    Finish,
    Catchup,
    SyncComplete,
    Error,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Info { .. } => FrameKind::Info,
            Self::Start { .. } => FrameKind::Start,
            Self::Tick { .. } => FrameKind::Tick,
            Self::Keyframe { .. } => FrameKind::Keyframe,
            Self::Delta { .. } => FrameKind::Delta,
            Self::Finish { .. } => FrameKind::Finish,
            Self::Catchup { .. } => FrameKind::Catchup,
            Self::SyncComplete { .. } => FrameKind::SyncComplete,
            Self::Error { .. } => FrameKind::Error,
        }
    }

    /// Whether back-pressure may drop this frame for a slow subscriber.
    /// Keyframes, lifecycle frames, and catch-up responses are never
    /// dropped; they may only fail if the transport itself is closed.
    pub fn is_droppable(&self) -> bool {
        matches!(self.kind(), FrameKind::Tick | FrameKind::Delta)
    }

    /// Sequence number, for sequenced frames.
    pub fn seq(&self) -> Option<Seq> {
        match self {
            Self::Start { seq, .. }
            | Self::Tick { seq, .. }
            | Self::Keyframe { seq, .. }
            | Self::Delta { seq, .. }
            | Self::Finish { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Tick index, for tick-bearing frames.
    pub fn tick_index(&self) -> Option<Tick> {
        match self {
            Self::Tick { tick_index, .. }
            | Self::Keyframe { tick_index, .. }
            | Self::Delta { tick_index, .. } => Some(*tick_index),
            _ => None,
        }
    }

    /// Name of the packed array field for the binary encoding.
    fn packed_field(&self) -> Option<&'static str> {
        match self {
            Self::Tick { .. } | Self::Keyframe { .. } => Some("positions"),
            Self::Delta { .. } => Some("deltas"),
            _ => None,
        }
    }
}

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Messages a subscriber may send upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Request a bounded catch-up window.
    #[serde(rename = "sync:request")]
    #[serde(rename_all = "camelCase")]
    SyncRequest {
        race_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_tick: Option<Tick>,
    },
}

// ============================================================================
// Encoding
// ============================================================================

/// An encoded outbound message, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Transport payload size in bytes, used by back-pressure accounting.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wire protocol error.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary payload missing header separator")]
    MissingSeparator,
    #[error("binary payload length {0} is not a multiple of 4")]
    RaggedFloatArray(usize),
    #[error("frame is not an object")]
    NotAnObject,
    #[error("signing failed: {0}")]
    Sign(#[from] SignError),
}

/// Encode a frame for one subscriber.
///
/// In binary mode the position array is split out of the header first and
/// the signature (if configured) covers the header; in text mode the
/// signature covers the whole frame.
pub fn encode_frame(
    frame: &Frame,
    signer: Option<&FrameSigner>,
    binary: bool,
) -> Result<WireMessage, WireError> {
    let mut value = serde_json::to_value(frame)?;

    if binary {
        if let Some(field) = frame.packed_field() {
            return Ok(WireMessage::Binary(pack_binary(value, field, signer)?));
        }
    }

    if let Some(signer) = signer {
        signer.attach_signature(&mut value)?;
    }
    Ok(WireMessage::Text(value.to_string()))
}

/// Split `field` (an f64 array) out of the header and append it packed as
/// little-endian f32 after a newline. The header is signed after the split.
fn pack_binary(
    mut value: Value,
    field: &str,
    signer: Option<&FrameSigner>,
) -> Result<Vec<u8>, WireError> {
    let object = value.as_object_mut().ok_or(WireError::NotAnObject)?;
    let array = object
        .remove(field)
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    object.insert("packed".to_string(), Value::String(field.to_string()));

    if let Some(signer) = signer {
        signer.attach_signature(&mut value)?;
    }

    let mut out = value.to_string().into_bytes();
    out.push(b'\n');
    for entry in array {
        let v = entry.as_f64().unwrap_or(0.0) as f32;
        out.extend_from_slice(&v.to_le_bytes());
    }
    Ok(out)
}

/// Decode a binary message back into a full JSON value (test and client
/// support; values come back as f64 widened from f32).
pub fn decode_binary(bytes: &[u8]) -> Result<Value, WireError> {
    let split = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(WireError::MissingSeparator)?;
    let (header, body) = (&bytes[..split], &bytes[split + 1..]);
    if body.len() % 4 != 0 {
        return Err(WireError::RaggedFloatArray(body.len()));
    }

    let mut value: Value = serde_json::from_slice(header)?;
    let object = value.as_object_mut().ok_or(WireError::NotAnObject)?;
    let field = object
        .remove("packed")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "positions".to_string());

    let floats: Vec<Value> = body
        .chunks_exact(4)
        .map(|c| {
            let v = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            serde_json::Number::from_f64(f64::from(v))
                .map(Value::Number)
                .unwrap_or(Value::Null)
        })
        .collect();
    object.insert(field, Value::Array(floats));
    Ok(value)
}

/// Decode a text message from a subscriber.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, WireError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a text frame (client support and tests).
pub fn decode_frame(text: &str) -> Result<Frame, WireError> {
    Ok(serde_json::from_str(text)?)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_frame() -> Frame {
        Frame::Tick {
            seq: 42,
            race_id: "race-1".to_string(),
            tick_index: 137,
            tick_ts: 1_700_000_006_850,
            positions: vec![10.5, 20.25, 30.0],
            proto_ver: PROTO_VER,
        }
    }

    #[test]
    fn test_tick_frame_roundtrip() {
        let frame = tick_frame();
        let encoded = encode_frame(&frame, None, false).unwrap();
        let WireMessage::Text(text) = encoded else {
            panic!("plain encoding must be text");
        };
        assert!(text.contains("\"type\":\"race:tick\""));
        let decoded = decode_frame(&text).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_info_frame_roundtrip_without_race() {
        let frame = Frame::Info {
            race_id: None,
            config: None,
            current_tick_index: None,
            proto_ver: PROTO_VER,
        };
        let encoded = encode_frame(&frame, None, false).unwrap();
        let WireMessage::Text(text) = encoded else {
            panic!()
        };
        assert_eq!(decode_frame(&text).unwrap(), frame);
    }

    #[test]
    fn test_delta_frame_roundtrip() {
        let frame = Frame::Delta {
            seq: 7,
            race_id: "race-1".to_string(),
            tick_index: 25,
            tick_ts: 1_250,
            keyframe_tick: 20,
            deltas: vec![0.5, -0.25, 1.0],
            proto_ver: PROTO_VER,
        };
        let encoded = encode_frame(&frame, None, false).unwrap();
        let WireMessage::Text(text) = encoded else {
            panic!()
        };
        assert_eq!(decode_frame(&text).unwrap(), frame);
    }

    #[test]
    fn test_binary_encoding_packs_positions() {
        let frame = tick_frame();
        let encoded = encode_frame(&frame, None, true).unwrap();
        let WireMessage::Binary(bytes) = encoded else {
            panic!("binary mode must produce bytes for tick frames");
        };

        let value = decode_binary(&bytes).unwrap();
        assert_eq!(value["type"], "race:tick");
        assert_eq!(value["seq"], 42);

        let positions: Vec<f64> = value["positions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert_eq!(positions.len(), 3);
        // f32 round trip: equal within single-precision tolerance.
        for (a, b) in positions.iter().zip(&[10.5, 20.25, 30.0]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_binary_mode_leaves_lifecycle_frames_as_text() {
        let frame = Frame::Finish {
            seq: 500,
            race_id: "race-1".to_string(),
            winner: "h03".to_string(),
            placements: vec!["h03".to_string(), "h01".to_string()],
            tick_ts: 20_000,
            proto_ver: PROTO_VER,
        };
        let encoded = encode_frame(&frame, None, true).unwrap();
        assert!(matches!(encoded, WireMessage::Text(_)));
    }

    #[test]
    fn test_droppability_classification() {
        assert!(tick_frame().is_droppable());

        let keyframe = Frame::Keyframe {
            seq: 1,
            race_id: "r".to_string(),
            tick_index: 0,
            tick_ts: 0,
            positions: vec![],
            proto_ver: PROTO_VER,
        };
        assert!(!keyframe.is_droppable());

        let info = Frame::Info {
            race_id: None,
            config: None,
            current_tick_index: None,
            proto_ver: PROTO_VER,
        };
        assert!(!info.is_droppable());
    }

    #[test]
    fn test_sync_request_parsing() {
        let msg = decode_client_message(r#"{"type":"sync:request","raceId":"race-1","fromTick":120}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SyncRequest {
                race_id: "race-1".to_string(),
                from_tick: Some(120),
            }
        );

        let msg = decode_client_message(r#"{"type":"sync:request","raceId":"race-1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SyncRequest {
                race_id: "race-1".to_string(),
                from_tick: None,
            }
        );
    }

    #[test]
    fn test_unknown_client_message_rejected() {
        assert!(decode_client_message(r#"{"type":"bet:place","amount":5}"#).is_err());
    }

    #[test]
    fn test_signed_text_frame_verifies() {
        let signer = FrameSigner::generate().unwrap();
        let encoded = encode_frame(&tick_frame(), Some(&signer), false).unwrap();
        let WireMessage::Text(text) = encoded else {
            panic!()
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["keyId"], signer.key_id());
        assert!(sign::verify_signed(&signer.verifying_key(), &value).unwrap());
    }

    #[test]
    fn test_signed_binary_header_verifies() {
        let signer = FrameSigner::generate().unwrap();
        let encoded = encode_frame(&tick_frame(), Some(&signer), true).unwrap();
        let WireMessage::Binary(bytes) = encoded else {
            panic!()
        };

        let split = bytes.iter().position(|&b| b == b'\n').unwrap();
        let header: serde_json::Value = serde_json::from_slice(&bytes[..split]).unwrap();
        assert!(sign::verify_signed(&signer.verifying_key(), &header).unwrap());
    }

    #[test]
    fn test_seq_accessor_covers_sequenced_frames() {
        assert_eq!(tick_frame().seq(), Some(42));
        let info = Frame::Info {
            race_id: None,
            config: None,
            current_tick_index: None,
            proto_ver: PROTO_VER,
        };
        assert_eq!(info.seq(), None);
    }
}
