use k9::assert_equal;
use serde_json::json;
use tether_proto::{
    decode, decode_with, encode, encode_with, Channel, DecodeError, DeviceType, ErrorCode,
    Message, PayloadCodec, Plain, Uid,
};

fn roundtrip(msg: &Message) -> Message {
    decode(&encode(msg)).unwrap().unwrap()
}

#[test]
fn test_register_request_roundtrip() {
    let original = Message::register(1, DeviceType::Toy, Channel::from("ch1"));
    assert_equal!(roundtrip(&original), original);

    let wire: serde_json::Value = serde_json::from_slice(&encode(&original)).unwrap();
    assert_equal!(
        wire,
        json!({"type": "register", "seq": 1, "data": {"deviceType": "toy", "channel": "ch1"}})
    );
}

#[test]
fn test_register_ack_roundtrip() {
    let original = Message::register_ack(3, Channel::from("ch1"), Uid::from("abc"));
    assert_equal!(roundtrip(&original), original);
}

#[test]
fn test_ping_roundtrip() {
    let original = Message::Ping {
        seq: 1234,
        uid: Uid::from("123422"),
        data: json!("1453020903937"),
    };
    assert_equal!(roundtrip(&original), original);
}

#[test]
fn test_nested_data_roundtrip() {
    let original = Message::Command {
        seq: 7,
        uid: Uid::from("u"),
        data: json!({"moredata": {"yetmore": {}}, "list": [1, 2.5, null, true]}),
        sticky: false,
    };
    assert_equal!(roundtrip(&original), original);
}

#[test]
fn test_newlines_in_data_roundtrip() {
    let original = Message::Status {
        seq: 8,
        uid: Uid::from("u"),
        data: json!({"newline": {"yetmoredata": "data wi\nth newlines\n"}}),
        sticky: true,
    };
    let bytes = encode(&original);
    assert!(!bytes.contains(&b'\n'));
    assert_equal!(decode(&bytes).unwrap().unwrap(), original);
}

#[test]
fn test_error_roundtrip() {
    let original = Message::error(5, Uid::from("gone"), ErrorCode::DeviceNotRegistered);
    assert_equal!(roundtrip(&original), original);

    let wire: serde_json::Value = serde_json::from_slice(&encode(&original)).unwrap();
    assert_equal!(wire["data"], json!("1001"));
}

#[test]
fn test_sticky_false_is_not_emitted() {
    let msg = Message::Status {
        seq: 1,
        uid: Uid::from("u"),
        data: json!("x"),
        sticky: false,
    };
    let wire: serde_json::Value = serde_json::from_slice(&encode(&msg)).unwrap();
    assert_equal!(wire, json!({"type": "status", "seq": 1, "uid": "u", "data": "x"}));
}

struct Reversed;

impl PayloadCodec for Reversed {
    fn compress(&self, mut json: Vec<u8>) -> Vec<u8> {
        json.reverse();
        json
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
        Ok(bytes.iter().rev().copied().collect())
    }
}

#[test]
fn test_payload_codec_wraps_json() {
    let original = Message::Command {
        seq: 2,
        uid: Uid::from("u"),
        data: json!("go"),
        sticky: false,
    };

    let plain = encode_with(&Plain, &original);
    assert_equal!(plain, encode(&original));

    let wrapped = encode_with(&Reversed, &original);
    assert!(decode(&wrapped).is_err());
    assert_equal!(decode_with(&Reversed, &wrapped).unwrap().unwrap(), original);
    assert_equal!(decode_with(&Reversed, b"").unwrap(), None);
}
