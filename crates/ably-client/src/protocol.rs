//! Wire protocol frames, constants, and the JSON/MessagePack codecs.

use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{codes, Error, ErrorInfo};

// ---------------------------------------------------------------------------
// Protocol action constants
// ---------------------------------------------------------------------------

pub mod action {
    pub const HEARTBEAT: i32 = 0;
    pub const ACK: i32 = 1;
    pub const NACK: i32 = 2;
    pub const CONNECT: i32 = 3;
    pub const CONNECTED: i32 = 4;
    pub const DISCONNECT: i32 = 5;
    pub const DISCONNECTED: i32 = 6;
    pub const CLOSE: i32 = 7;
    pub const CLOSED: i32 = 8;
    pub const ERROR: i32 = 9;
    pub const ATTACH: i32 = 10;
    pub const ATTACHED: i32 = 11;
    pub const DETACH: i32 = 12;
    pub const DETACHED: i32 = 13;
    pub const PRESENCE: i32 = 14;
    pub const MESSAGE: i32 = 15;
    pub const SYNC: i32 = 16;
    pub const AUTH: i32 = 17;
}

pub mod flags {
    pub const HAS_PRESENCE: i32 = 1;
    pub const HAS_BACKLOG: i32 = 2;
    pub const RESUMED: i32 = 4;
    pub const ATTACH_RESUME: i32 = 1 << 5;
    pub const MODE_PRESENCE: i32 = 1 << 16;
    pub const MODE_PUBLISH: i32 = 1 << 17;
    pub const MODE_SUBSCRIBE: i32 = 1 << 18;
    pub const MODE_PRESENCE_SUBSCRIBE: i32 = 1 << 19;
}

/// Presence actions as carried on the wire.
pub mod presence_action {
    pub const ABSENT: i32 = 0;
    pub const PRESENT: i32 = 1;
    pub const ENTER: i32 = 2;
    pub const LEAVE: i32 = 3;
    pub const UPDATE: i32 = 4;
}

// ---------------------------------------------------------------------------
// Wire protocol types
// ---------------------------------------------------------------------------

// NOTE: We intentionally omit `skip_serializing_if = "Option::is_none"` on
// these structs. rmp_serde has a long-standing bug where skipped Option fields
// cause deserialization failures: https://github.com/3Hren/msgpack-rust/issues/86
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: i32,
    pub id: Option<String>,
    pub channel: Option<String>,
    pub channel_serial: Option<String>,
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_details: Option<ConnectionDetails>,
    pub connection_serial: Option<i64>,
    pub msg_serial: Option<i64>,
    pub count: Option<i32>,
    pub flags: Option<i32>,
    pub timestamp: Option<i64>,
    pub error: Option<ErrorInfo>,
    pub auth: Option<AuthDetails>,
    pub messages: Option<Vec<WireMessage>>,
    pub presence: Option<Vec<WirePresenceMessage>>,
    pub params: Option<HashMap<String, String>>,
}

impl ProtocolMessage {
    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }

    /// Whether an ACK/NACK is expected for this frame.
    pub fn expects_ack(&self) -> bool {
        matches!(self.action, action::MESSAGE | action::PRESENCE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_state_ttl: Option<i64>,
    pub max_idle_interval: Option<i64>,
    pub max_message_size: Option<i64>,
    pub max_frame_size: Option<i64>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// A channel message as serialized inside a protocol frame. Payload decoding
/// into [`Data`](crate::message::Data) happens in `message.rs`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct WireMessage {
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
    pub encoding: Option<String>,
    pub timestamp: Option<i64>,
    pub extras: Option<serde_json::Value>,
}

// Spelled out rather than flattening a WireMessage: serde(flatten) forces
// unknown-length maps, which rmp-serde cannot encode.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct WirePresenceMessage {
    pub action: i32,
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub data: Option<serde_json::Value>,
    pub encoding: Option<String>,
    pub timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Frame encode / decode
// ---------------------------------------------------------------------------

pub fn encode_frame(msg: &ProtocolMessage, binary: bool) -> Result<Vec<u8>, Error> {
    if binary {
        Ok(rmp_serde::to_vec_named(msg)?)
    } else {
        Ok(serde_json::to_vec(msg)?)
    }
}

pub fn decode_frame(data: &[u8], binary: bool) -> Result<ProtocolMessage, Error> {
    if !binary {
        return serde_json::from_slice(data).map_err(|e| {
            Error::Protocol(
                ErrorInfo::new(codes::BAD_REQUEST, format!("frame decode error: {e}"))
                    .with_status(400),
            )
        });
    }
    // Three-step decode: msgpack → rmpv::Value → serde_json::Value → struct.
    //
    // 1. rmpv::Value handles msgpack binary data (which serde_json::Value cannot).
    // 2. serde_json::Value deduplicates map keys (servers may send "messages"
    //    twice, which rmp_serde's struct deserializer rejects).
    // This adds allocation overhead compared to direct struct deserialization.
    let json = msgpack_to_json(data)?;
    serde_json::from_value(json).map_err(|e| {
        Error::Protocol(
            ErrorInfo::new(codes::BAD_REQUEST, format!("frame decode error: {e}"))
                .with_status(400),
        )
    })
}

/// Decode a MessagePack body into a JSON value, encoding binary data as
/// base64 strings. Used for both realtime frames and REST response bodies.
pub(crate) fn msgpack_to_json(data: &[u8]) -> Result<serde_json::Value, Error> {
    let mut cursor = std::io::Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor).map_err(|e| {
        Error::Protocol(
            ErrorInfo::new(codes::BAD_REQUEST, format!("msgpack decode error: {e}"))
                .with_status(400),
        )
    })?;
    Ok(rmpv_to_json(value))
}

/// Convert an rmpv::Value to serde_json::Value, encoding binary data as base64
/// strings.
fn rmpv_to_json(value: rmpv::Value) -> serde_json::Value {
    match value {
        rmpv::Value::Nil => serde_json::Value::Null,
        rmpv::Value::Boolean(b) => serde_json::Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                serde_json::Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                serde_json::Value::Number(n.into())
            } else {
                serde_json::Value::Null
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::String(s) => {
            if s.is_str() {
                serde_json::Value::String(s.into_str().unwrap_or_default().to_string())
            } else {
                tracing::warn!("msgpack string contains invalid UTF-8, substituting empty string");
                serde_json::Value::String(String::new())
            }
        }
        rmpv::Value::Binary(bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            serde_json::Value::String(encoded)
        }
        rmpv::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(rmpv_to_json).collect())
        }
        rmpv::Value::Map(map) => {
            let obj = map
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => {
                            if s.is_str() {
                                s.into_str().unwrap_or_default().to_string()
                            } else {
                                tracing::warn!(
                                    "msgpack map key contains invalid UTF-8, substituting empty string"
                                );
                                String::new()
                            }
                        }
                        other => format!("{other}"),
                    };
                    (key, rmpv_to_json(v))
                })
                .collect();
            serde_json::Value::Object(obj)
        }
        rmpv::Value::Ext(_, bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            serde_json::Value::String(encoded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &ProtocolMessage, binary: bool) -> ProtocolMessage {
        let data = encode_frame(msg, binary).unwrap();
        decode_frame(&data, binary).unwrap()
    }

    #[test]
    fn encode_decode_connect_with_resume() {
        for binary in [true, false] {
            let msg = ProtocolMessage {
                action: action::CONNECT,
                connection_key: Some("key!abc".into()),
                connection_serial: Some(42),
                msg_serial: Some(7),
                ..Default::default()
            };
            let decoded = round_trip(&msg, binary);
            assert_eq!(decoded.action, action::CONNECT);
            assert_eq!(decoded.connection_key.as_deref(), Some("key!abc"));
            assert_eq!(decoded.connection_serial, Some(42));
            assert_eq!(decoded.msg_serial, Some(7));
        }
    }

    #[test]
    fn encode_decode_connected() {
        let msg = ProtocolMessage {
            action: action::CONNECTED,
            connection_id: Some("abc123".into()),
            connection_key: Some("abc123!key".into()),
            connection_serial: Some(-1),
            connection_details: Some(ConnectionDetails {
                connection_state_ttl: Some(120000),
                max_idle_interval: Some(15000),
                server_id: Some("frontend.0".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let decoded = round_trip(&msg, true);
        assert_eq!(decoded.action, action::CONNECTED);
        assert_eq!(decoded.connection_id.as_deref(), Some("abc123"));
        let details = decoded.connection_details.as_ref().unwrap();
        assert_eq!(details.connection_state_ttl, Some(120000));
        assert_eq!(details.max_idle_interval, Some(15000));
    }

    #[test]
    fn encode_decode_ack() {
        let msg = ProtocolMessage {
            action: action::ACK,
            msg_serial: Some(3),
            count: Some(2),
            ..Default::default()
        };
        let decoded = round_trip(&msg, true);
        assert_eq!(decoded.action, action::ACK);
        assert_eq!(decoded.msg_serial, Some(3));
        assert_eq!(decoded.count, Some(2));
    }

    #[test]
    fn encode_decode_message_with_data() {
        let msg = ProtocolMessage {
            action: action::MESSAGE,
            channel: Some("orders:live".into()),
            connection_serial: Some(5),
            messages: Some(vec![WireMessage {
                id: Some("msg-001".into()),
                name: Some("update".into()),
                data: Some(serde_json::json!({"orderId": "o-123"})),
                client_id: Some("publisher".into()),
                timestamp: Some(1700000000000),
                ..Default::default()
            }]),
            ..Default::default()
        };
        for binary in [true, false] {
            let decoded = round_trip(&msg, binary);
            assert_eq!(decoded.action, action::MESSAGE);
            let messages = decoded.messages.as_ref().unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].name.as_deref(), Some("update"));
            assert_eq!(
                messages[0]
                    .data
                    .as_ref()
                    .and_then(|d| d.get("orderId"))
                    .and_then(|v| v.as_str()),
                Some("o-123")
            );
        }
    }

    #[test]
    fn encode_decode_presence() {
        let msg = ProtocolMessage {
            action: action::PRESENCE,
            channel: Some("room".into()),
            presence: Some(vec![WirePresenceMessage {
                action: presence_action::ENTER,
                client_id: Some("alice".into()),
                connection_id: Some("conn-1".into()),
                data: Some(serde_json::json!("hello")),
                ..Default::default()
            }]),
            ..Default::default()
        };
        for binary in [true, false] {
            let decoded = round_trip(&msg, binary);
            let presence = decoded.presence.as_ref().unwrap();
            assert_eq!(presence.len(), 1);
            assert_eq!(presence[0].action, presence_action::ENTER);
            assert_eq!(presence[0].client_id.as_deref(), Some("alice"));
        }
    }

    #[test]
    fn presence_wire_fields_use_camel_case() {
        let msg = ProtocolMessage {
            action: action::PRESENCE,
            presence: Some(vec![WirePresenceMessage {
                action: presence_action::LEAVE,
                client_id: Some("bob".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let data = encode_frame(&msg, false).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        let entry = &value["presence"][0];
        assert_eq!(entry["action"], 3);
        assert_eq!(entry["clientId"], "bob");
    }

    #[test]
    fn encode_decode_error_frame() {
        let msg = ProtocolMessage {
            action: action::ERROR,
            error: Some(ErrorInfo::new(40142, "Token expired").with_status(401)),
            ..Default::default()
        };
        let decoded = round_trip(&msg, true);
        let err = decoded.error.as_ref().unwrap();
        assert_eq!(err.code, 40142);
        assert_eq!(err.status_code, Some(401));
        assert_eq!(err.message, "Token expired");
    }

    #[test]
    fn encode_decode_sync() {
        let msg = ProtocolMessage {
            action: action::SYNC,
            channel: Some("room".into()),
            channel_serial: Some("cursor:remaining".into()),
            presence: Some(vec![]),
            ..Default::default()
        };
        let decoded = round_trip(&msg, true);
        assert_eq!(decoded.action, action::SYNC);
        assert_eq!(decoded.channel_serial.as_deref(), Some("cursor:remaining"));
    }

    #[test]
    fn has_flag() {
        let msg = ProtocolMessage {
            action: action::ATTACHED,
            flags: Some(flags::RESUMED | flags::HAS_PRESENCE),
            ..Default::default()
        };
        assert!(msg.has_flag(flags::RESUMED));
        assert!(msg.has_flag(flags::HAS_PRESENCE));
        assert!(!msg.has_flag(flags::HAS_BACKLOG));
    }

    #[test]
    fn action_constants() {
        assert_eq!(action::HEARTBEAT, 0);
        assert_eq!(action::ACK, 1);
        assert_eq!(action::NACK, 2);
        assert_eq!(action::CONNECT, 3);
        assert_eq!(action::CONNECTED, 4);
        assert_eq!(action::DISCONNECTED, 6);
        assert_eq!(action::CLOSE, 7);
        assert_eq!(action::CLOSED, 8);
        assert_eq!(action::ERROR, 9);
        assert_eq!(action::ATTACH, 10);
        assert_eq!(action::ATTACHED, 11);
        assert_eq!(action::DETACH, 12);
        assert_eq!(action::DETACHED, 13);
        assert_eq!(action::PRESENCE, 14);
        assert_eq!(action::MESSAGE, 15);
        assert_eq!(action::SYNC, 16);
        assert_eq!(action::AUTH, 17);
    }

    #[test]
    fn expects_ack() {
        let msg = ProtocolMessage {
            action: action::MESSAGE,
            ..Default::default()
        };
        assert!(msg.expects_ack());
        let msg = ProtocolMessage {
            action: action::ATTACH,
            ..Default::default()
        };
        assert!(!msg.expects_ack());
    }
}
