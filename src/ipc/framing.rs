//! Wire protocol codec.
//!
//! Each frame is a length prefix followed by a MessagePack map:
//!
//! ```text
//! [u32 LE length] [msgpack {"head": {...}, "body": <value | bin>}]
//! ```
//!
//! `head` carries protocol metadata; the only key the transport itself
//! interprets is `mid`, the correlation id of a request/reply exchange.
//! `body` is either a MessagePack value or, for payloads that were already
//! serialized by the caller, an opaque binary string ([`Body::Raw`]).
//!
//! Decoding is incremental: [`FrameDecoder::feed`] accepts arbitrary chunks
//! and returns every frame completed by that chunk, keeping the tail.

use bytes::Bytes;
use rmpv::{Value, ValueRef};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{IpcError, Result};

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEAD_KEY: &str = "head";
const BODY_KEY: &str = "body";
const MID_KEY: &str = "mid";

/// Correlation id carried in `head.mid`.
pub type MessageId = u64;

/// Frame metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Head {
    /// Correlation id for request/reply; `None` for one-way messages.
    pub mid: Option<MessageId>,
    /// Any other head entries, preserved as-is.
    pub extra: Vec<(Value, Value)>,
}

impl Head {
    /// Head carrying only a correlation id.
    pub fn with_mid(mid: MessageId) -> Self {
        Self {
            mid: Some(mid),
            extra: Vec::new(),
        }
    }
}

/// Message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Already-encoded bytes, written as a binary string without re-encoding.
    Raw(Bytes),
    /// A self-describing value encoded inline.
    Value(Value),
}

impl Body {
    /// Serialize `value` to MessagePack bytes and carry them raw.
    pub fn encode_raw<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = rmp_serde::to_vec_named(value).map_err(|e| IpcError::Encode(e.to_string()))?;
        Ok(Body::Raw(Bytes::from(bytes)))
    }

    /// Convert `value` into an inline MessagePack value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        rmpv::ext::to_value(value)
            .map(Body::Value)
            .map_err(|e| IpcError::Encode(e.to_string()))
    }

    /// Deserialize the payload.
    ///
    /// Raw bodies are assumed to hold MessagePack bytes.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Body::Raw(bytes) => {
                rmp_serde::from_slice(bytes).map_err(|e| IpcError::Decode(e.to_string()))
            }
            Body::Value(value) => {
                rmpv::ext::from_value(value.clone()).map_err(|e| IpcError::Decode(e.to_string()))
            }
        }
    }

    /// Raw bytes, if this is a raw body.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Raw(bytes) => Some(bytes),
            Body::Value(_) => None,
        }
    }

    fn as_value_ref(&self) -> ValueRef<'_> {
        match self {
            Body::Raw(bytes) => ValueRef::Binary(&bytes[..]),
            Body::Value(value) => value.as_ref(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Raw(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Raw(Bytes::from(bytes))
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Value(value)
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        // JSON is a strict subset of the MessagePack value model.
        Body::Value(rmpv::ext::to_value(&value).unwrap_or(Value::Nil))
    }
}

/// One `{head, body}` unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Protocol metadata.
    pub head: Head,
    /// Payload.
    pub body: Body,
}

impl Frame {
    /// One-way frame with an empty head.
    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            head: Head::default(),
            body: body.into(),
        }
    }

    /// Frame correlated to a request/reply exchange.
    pub fn with_mid(mid: MessageId, body: impl Into<Body>) -> Self {
        Self {
            head: Head::with_mid(mid),
            body: body.into(),
        }
    }

    /// Encode this frame into wire bytes: `[u32 LE length][msgpack map]`.
    pub fn encode(&self) -> Result<Bytes> {
        let mut head: Vec<(ValueRef<'_>, ValueRef<'_>)> = Vec::with_capacity(1 + self.head.extra.len());
        if let Some(mid) = self.head.mid {
            head.push((ValueRef::from(MID_KEY), ValueRef::from(mid)));
        }
        head.extend(self.head.extra.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));

        let map = ValueRef::Map(vec![
            (ValueRef::from(HEAD_KEY), ValueRef::Map(head)),
            (ValueRef::from(BODY_KEY), self.body.as_value_ref()),
        ]);

        let mut buf = vec![0u8; 4];
        rmpv::encode::write_value_ref(&mut buf, &map).map_err(|e| IpcError::Encode(e.to_string()))?;

        let length = buf.len() - 4;
        if length > MAX_FRAME_SIZE {
            return Err(IpcError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }
        // Bounded by MAX_FRAME_SIZE above
        #[allow(clippy::cast_possible_truncation, reason = "length <= MAX_FRAME_SIZE")]
        buf[..4].copy_from_slice(&(length as u32).to_le_bytes());
        Ok(Bytes::from(buf))
    }
}

/// Decode one frame payload (without the length prefix).
fn decode_frame(payload: &[u8]) -> Result<Frame> {
    let mut cursor = payload;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| IpcError::Decode(format!("invalid msgpack: {e}")))?;
    if !cursor.is_empty() {
        return Err(IpcError::Decode(format!(
            "{} trailing bytes after frame",
            cursor.len()
        )));
    }

    let Value::Map(entries) = value else {
        return Err(IpcError::Decode("frame is not a map".to_string()));
    };

    let mut head = Head::default();
    let mut body = None;
    for (key, value) in entries {
        match key.as_str() {
            Some(HEAD_KEY) => head = decode_head(value)?,
            Some(BODY_KEY) => {
                body = Some(match value {
                    Value::Binary(bytes) => Body::Raw(Bytes::from(bytes)),
                    other => Body::Value(other),
                });
            }
            _ => {}
        }
    }

    let body = body.ok_or_else(|| IpcError::Decode("frame has no body".to_string()))?;
    Ok(Frame { head, body })
}

fn decode_head(value: Value) -> Result<Head> {
    let entries = match value {
        Value::Map(entries) => entries,
        Value::Nil => return Ok(Head::default()),
        other => return Err(IpcError::Decode(format!("frame head is not a map: {other}"))),
    };

    let mut head = Head::default();
    for (key, value) in entries {
        if key.as_str() == Some(MID_KEY) {
            head.mid = match &value {
                Value::Nil => None,
                v => Some(
                    v.as_u64()
                        .ok_or_else(|| IpcError::Decode(format!("invalid mid: {v}")))?,
                ),
            };
        } else {
            head.extra.push((key, value));
        }
    }
    Ok(head)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
/// Handles stream reassembly across arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Returns decoded frames. Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds the size limit.
    /// The stream should be considered unusable afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut consumed = 0;

        loop {
            let rest = &self.buf[consumed..];
            // Need at least 4 bytes for the length header
            if rest.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if length == 0 {
                return Err(IpcError::Decode("invalid frame: zero length".to_string()));
            }
            if length > MAX_FRAME_SIZE {
                return Err(IpcError::FrameTooLarge {
                    size: length,
                    max: MAX_FRAME_SIZE,
                });
            }

            let total = 4 + length;
            if rest.len() < total {
                break; // Incomplete frame, wait for more data
            }

            frames.push(decode_frame(&rest[4..total])?);
            consumed += total;
        }

        self.buf.drain(..consumed);
        Ok(frames)
    }

    /// Convenience for callers that only care about payloads.
    pub fn feed_bodies(&mut self, bytes: &[u8]) -> Result<Vec<Body>> {
        Ok(self.feed(bytes)?.into_iter().map(|f| f.body).collect())
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop any buffered partial frame (used when a new connection starts).
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(json!({"x": 1})),
            Frame::with_mid(7, Body::encode_raw(&json!({"fun": "test.ping"})).unwrap()),
            Frame::new(Bytes::from_static(b"")),
            Frame::new(json!({"nested": {"list": [1, -2, 3.5, "four", null, true]}})),
            Frame::new(vec![0xffu8; 3000]),
        ]
    }

    fn encode_all(frames: &[Frame]) -> Vec<u8> {
        let mut wire = Vec::new();
        for frame in frames {
            wire.extend_from_slice(&frame.encode().unwrap());
        }
        wire
    }

    #[test]
    fn test_json_numbers_keep_their_kind() {
        let body = Body::from(json!({"u": 7, "i": -2, "f": 3.5, "s": "x", "n": null}));
        let Body::Value(Value::Map(entries)) = &body else {
            panic!("expected an inline map, got {body:?}");
        };
        let get = |key: &str| {
            entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("u"), Value::from(7u64));
        assert_eq!(get("i"), Value::from(-2i64));
        assert_eq!(get("f"), Value::F64(3.5));
        assert_eq!(get("s"), Value::from("x"));
        assert_eq!(get("n"), Value::Nil);
    }

    #[test]
    fn test_json_body_decodes_back() {
        let frame = Frame::new(json!({"type": "event", "tag": "salt/job"}));
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame.encode().unwrap()).unwrap();
        assert_eq!(frames, vec![frame]);
        assert!(!decoder.has_partial());

        let value: serde_json::Value = frames[0].body.decode().unwrap();
        assert_eq!(value, json!({"type": "event", "tag": "salt/job"}));
    }

    #[test]
    fn test_raw_body_is_not_re_encoded() {
        let payload = Body::encode_raw(&json!({"ret": true})).unwrap();
        let raw = payload.as_bytes().unwrap().clone();

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&Frame::new(payload).encode().unwrap()).unwrap();
        assert_eq!(frames[0].body, Body::Raw(raw));
        let value: serde_json::Value = frames[0].body.decode().unwrap();
        assert_eq!(value, json!({"ret": true}));
    }

    #[test]
    fn test_mid_and_extra_head_preserved() {
        let mut frame = Frame::with_mid(42, json!("reply"));
        frame.head.extra.push((Value::from("tgt"), Value::from("minion")));

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame.encode().unwrap()).unwrap();
        assert_eq!(frames[0].head.mid, Some(42));
        assert_eq!(frames[0].head.extra, frame.head.extra);
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let frames = sample_frames();
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&encode_all(&frames)).unwrap(), frames);
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_result() {
        let frames = sample_frames();
        let wire = encode_all(&frames);

        for chunk in [1usize, 2, 3, 5, 7, 64, 4096, wire.len()] {
            let mut decoder = FrameDecoder::new();
            let mut out = Vec::new();
            for piece in wire.chunks(chunk) {
                out.extend(decoder.feed(piece).unwrap());
            }
            assert_eq!(out, frames, "chunk size {chunk}");
            assert!(!decoder.has_partial());
        }

        // Uneven split points too
        for split in 1..wire.len().min(200) {
            let mut decoder = FrameDecoder::new();
            let mut out = decoder.feed(&wire[..split]).unwrap();
            out.extend(decoder.feed(&wire[split..]).unwrap());
            assert_eq!(out, frames, "split at {split}");
        }
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let encoded = Frame::new(json!({"key": "value"})).encode().unwrap();
        let mut decoder = FrameDecoder::new();

        let mid = encoded.len() / 2;
        assert!(decoder.feed(&encoded[..mid]).unwrap().is_empty());
        assert!(decoder.has_partial());

        assert_eq!(decoder.feed(&encoded[mid..]).unwrap().len(), 1);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut decoder = FrameDecoder::new();
        assert!(matches!(decoder.feed(&[0u8; 4]), Err(IpcError::Decode(_))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        #[allow(clippy::cast_possible_truncation, reason = "constant fits")]
        let length = (MAX_FRAME_SIZE + 1) as u32;
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.feed(&length.to_le_bytes()),
            Err(IpcError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let payload = [0xc1u8, 0x00]; // 0xc1 is never used in msgpack
        let mut wire = 2u32.to_le_bytes().to_vec();
        wire.extend_from_slice(&payload);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(decoder.feed(&wire), Err(IpcError::Decode(_))));
    }

    #[test]
    fn test_missing_body_rejected() {
        let map = Value::Map(vec![(Value::from("head"), Value::Map(vec![]))]);
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &map).unwrap();
        #[allow(clippy::cast_possible_truncation, reason = "tiny payload")]
        let mut wire = (payload.len() as u32).to_le_bytes().to_vec();
        wire.extend_from_slice(&payload);

        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&wire).unwrap_err();
        assert!(err.to_string().contains("no body"), "unexpected error: {err}");
    }

    #[test]
    fn test_reset_discards_partial() {
        let encoded = Frame::new(json!(1)).encode().unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded[..3]).unwrap();
        decoder.reset();
        assert!(!decoder.has_partial());
        assert_eq!(decoder.feed(&encoded).unwrap().len(), 1);
    }
}
