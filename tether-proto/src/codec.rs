use serde_json::{Map, Value};
use thiserror::Error;

use crate::message::{Message, MessageKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("`{kind}` message has the wrong field set (missing {missing:?}, unexpected {extra:?})")]
    FieldSet {
        kind: MessageKind,
        missing: Vec<String>,
        extra: Vec<String>,
    },
    #[error("invalid `{kind}` message: {reason}")]
    Shape { kind: MessageKind, reason: String },
    #[error("payload codec failed: {0}")]
    Codec(String),
}

/// Optional wrapping of the JSON bytes, used purely to shrink datagrams.
/// Implementations must round-trip losslessly.
pub trait PayloadCodec: Send + Sync + 'static {
    fn compress(&self, json: Vec<u8>) -> Vec<u8>;
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, DecodeError>;
}

/// The identity codec: plain JSON on the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plain;

impl PayloadCodec for Plain {
    fn compress(&self, json: Vec<u8>) -> Vec<u8> {
        json
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
        Ok(bytes.to_vec())
    }
}

/// Serialize a message. Only the fields of the message's kind are emitted,
/// so nothing but the canonical envelope ever reaches the wire.
pub fn encode(msg: &Message) -> Vec<u8> {
    serde_json::to_vec(msg).expect("messages only contain string-keyed JSON")
}

pub fn encode_with(codec: &dyn PayloadCodec, msg: &Message) -> Vec<u8> {
    codec.compress(encode(msg))
}

/// Parse and validate one message.
///
/// Empty (or all-whitespace) input is `Ok(None)`: stream transports produce
/// it when the remote end closes, and it is not a protocol error.
pub fn decode(bytes: &[u8]) -> Result<Option<Message>, DecodeError> {
    if is_blank(bytes) {
        return Ok(None);
    }

    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Json(e.to_string()))?;
    let Value::Object(map) = &value else {
        return Err(DecodeError::NotAnObject);
    };

    let kind = match map.get("type") {
        Some(Value::String(t)) => {
            MessageKind::parse(t).ok_or_else(|| DecodeError::UnknownType(t.clone()))?
        }
        _ => return Err(DecodeError::MissingType),
    };
    check_field_set(kind, map)?;

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| DecodeError::Shape {
            kind,
            reason: e.to_string(),
        })
}

pub fn decode_with(codec: &dyn PayloadCodec, bytes: &[u8]) -> Result<Option<Message>, DecodeError> {
    if is_blank(bytes) {
        return Ok(None);
    }
    decode(&codec.decompress(bytes)?)
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

fn check_field_set(kind: MessageKind, map: &Map<String, Value>) -> Result<(), DecodeError> {
    let required = kind.required_fields();
    let optional = kind.optional_fields();

    let missing: Vec<String> = required
        .iter()
        .filter(|key| !map.contains_key(**key))
        .map(|key| key.to_string())
        .collect();
    let extra: Vec<String> = map
        .keys()
        .filter(|key| !required.contains(&key.as_str()) && !optional.contains(&key.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() && extra.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::FieldSet {
            kind,
            missing,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn blank_input_is_no_message() {
        assert_equal!(decode(b"").unwrap(), None);
        assert_equal!(decode(b"  \r\n").unwrap(), None);
    }

    #[test]
    fn rejects_non_object() {
        assert_equal!(decode(b"[1,2]").unwrap_err(), DecodeError::NotAnObject);
        assert!(matches!(decode(b"{oops").unwrap_err(), DecodeError::Json(_)));
    }

    #[test]
    fn rejects_unknown_type() {
        assert_equal!(
            decode(br#"{"type":"hello","seq":1,"data":"x","uid":"u"}"#).unwrap_err(),
            DecodeError::UnknownType("hello".to_string())
        );
        assert_equal!(
            decode(br#"{"seq":1,"data":"x","uid":"u"}"#).unwrap_err(),
            DecodeError::MissingType
        );
    }

    #[test]
    fn rejects_missing_and_extra_fields() {
        assert_equal!(
            decode(br#"{"type":"ping","seq":1,"data":"x"}"#).unwrap_err(),
            DecodeError::FieldSet {
                kind: MessageKind::Ping,
                missing: vec!["uid".to_string()],
                extra: vec![],
            }
        );
        assert_equal!(
            decode(br#"{"type":"register","seq":1,"uid":"u","data":{"deviceType":"toy","channel":"1"}}"#)
                .unwrap_err(),
            DecodeError::FieldSet {
                kind: MessageKind::Register,
                missing: vec![],
                extra: vec!["uid".to_string()],
            }
        );
    }

    #[test]
    fn sticky_only_allowed_on_status_and_command() {
        assert!(decode(br#"{"type":"status","seq":1,"uid":"u","data":"x","sticky":true}"#)
            .unwrap()
            .is_some());
        assert!(matches!(
            decode(br#"{"type":"ping","seq":1,"uid":"u","data":"x","sticky":true}"#).unwrap_err(),
            DecodeError::FieldSet { .. }
        ));
    }

    #[test]
    fn bad_field_types_are_shape_errors() {
        assert!(matches!(
            decode(br#"{"type":"status","seq":-4,"uid":"u","data":"x"}"#).unwrap_err(),
            DecodeError::Shape {
                kind: MessageKind::Status,
                ..
            }
        ));
        assert!(matches!(
            decode(br#"{"type":"register","seq":1,"data":{"deviceType":"robot","channel":"1"}}"#)
                .unwrap_err(),
            DecodeError::Shape {
                kind: MessageKind::Register,
                ..
            }
        ));
    }
}
