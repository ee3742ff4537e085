//! Channel message payloads and the layered encoding chain.
//!
//! A payload travels the wire as a string plus a `/`-separated `encoding`
//! chain (`base64`, `utf-8`, `json`, `cipher+aes-128-cbc`), applied
//! left-to-right on encode and unwound right-to-left on decode.

use base64::Engine as _;

use crate::crypto::CipherParams;
use crate::error::Error;
use crate::protocol::{presence_action, WireMessage, WirePresenceMessage};

const ENC_BASE64: &str = "base64";
const ENC_UTF8: &str = "utf-8";
const ENC_JSON: &str = "json";
const ENC_CIPHER_PREFIX: &str = "cipher+";

/// A decoded message payload.
///
/// JSON payloads must be objects or arrays; scalars are rejected at encode
/// time.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Data {
    #[default]
    None,
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl Data {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Data::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Data::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Data::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::Text(s.to_string())
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::Text(s)
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Data::Binary(b)
    }
}

impl From<serde_json::Value> for Data {
    fn from(v: serde_json::Value) -> Self {
        Data::Json(v)
    }
}

/// A message published to or received from a channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub name: Option<String>,
    pub data: Data,
    /// Residual encoding chain. Empty after a fully successful decode.
    pub encoding: Option<String>,
    pub timestamp: Option<i64>,
    pub extras: Option<serde_json::Value>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: impl Into<Data>) -> Self {
        Message {
            name: Some(name.into()),
            data: data.into(),
            ..Default::default()
        }
    }

    pub(crate) fn encoded(&self, cipher: Option<&CipherParams>) -> Result<WireMessage, Error> {
        let (data, encoding) = encode_data(self.data.clone(), self.encoding.clone(), cipher)?;
        Ok(WireMessage {
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            connection_id: self.connection_id.clone(),
            name: self.name.clone(),
            data,
            encoding,
            timestamp: self.timestamp,
            extras: self.extras.clone(),
        })
    }

    /// Decode a wire message. On a decode failure the partially decoded
    /// payload and the unconsumed encoding chain are retained on the returned
    /// message, alongside the error.
    pub(crate) fn from_wire(
        wire: WireMessage,
        cipher: Option<&CipherParams>,
    ) -> (Message, Option<Error>) {
        let (data, encoding, err) = decode_data(wire.data, wire.encoding, cipher);
        (
            Message {
                id: wire.id,
                client_id: wire.client_id,
                connection_id: wire.connection_id,
                name: wire.name,
                data,
                encoding,
                timestamp: wire.timestamp,
                extras: wire.extras,
            },
            err,
        )
    }

    /// Backfill id, connection id and timestamp from the enclosing protocol
    /// frame for messages that don't carry their own.
    pub(crate) fn update_empty_fields(
        &mut self,
        frame_id: Option<&str>,
        frame_connection_id: Option<&str>,
        frame_timestamp: Option<i64>,
        index: usize,
    ) {
        if self.id.is_none() {
            if let Some(fid) = frame_id {
                self.id = Some(format!("{fid}:{index}"));
            }
        }
        if self.connection_id.is_none() {
            self.connection_id = frame_connection_id.map(str::to_string);
        }
        if self.timestamp.is_none() {
            self.timestamp = frame_timestamp;
        }
    }
}

/// Presence transition types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceAction {
    Absent,
    Present,
    Enter,
    Leave,
    Update,
}

impl PresenceAction {
    pub(crate) fn from_wire(action: i32) -> Option<Self> {
        match action {
            presence_action::ABSENT => Some(PresenceAction::Absent),
            presence_action::PRESENT => Some(PresenceAction::Present),
            presence_action::ENTER => Some(PresenceAction::Enter),
            presence_action::LEAVE => Some(PresenceAction::Leave),
            presence_action::UPDATE => Some(PresenceAction::Update),
            _ => None,
        }
    }

    pub(crate) fn to_wire(self) -> i32 {
        match self {
            PresenceAction::Absent => presence_action::ABSENT,
            PresenceAction::Present => presence_action::PRESENT,
            PresenceAction::Enter => presence_action::ENTER,
            PresenceAction::Leave => presence_action::LEAVE,
            PresenceAction::Update => presence_action::UPDATE,
        }
    }
}

impl std::fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PresenceAction::Absent => "ABSENT",
            PresenceAction::Present => "PRESENT",
            PresenceAction::Enter => "ENTER",
            PresenceAction::Leave => "LEAVE",
            PresenceAction::Update => "UPDATE",
        };
        f.write_str(s)
    }
}

/// A member's presence transition on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMessage {
    pub action: PresenceAction,
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub data: Data,
    pub encoding: Option<String>,
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    pub(crate) fn encoded(
        &self,
        cipher: Option<&CipherParams>,
    ) -> Result<WirePresenceMessage, Error> {
        let (data, encoding) = encode_data(self.data.clone(), self.encoding.clone(), cipher)?;
        Ok(WirePresenceMessage {
            action: self.action.to_wire(),
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            connection_id: self.connection_id.clone(),
            data,
            encoding,
            timestamp: self.timestamp,
        })
    }

    pub(crate) fn from_wire(
        wire: WirePresenceMessage,
        cipher: Option<&CipherParams>,
    ) -> (PresenceMessage, Option<Error>) {
        let (data, encoding, err) = decode_data(wire.data, wire.encoding, cipher);
        let action = PresenceAction::from_wire(wire.action).unwrap_or(PresenceAction::Absent);
        (
            PresenceMessage {
                action,
                id: wire.id,
                client_id: wire.client_id,
                connection_id: wire.connection_id,
                data,
                encoding,
                timestamp: wire.timestamp,
            },
            err,
        )
    }

    /// Presence-set key for this member.
    pub(crate) fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.client_id.as_deref().unwrap_or_default(),
            self.connection_id.as_deref().unwrap_or_default()
        )
    }
}

// ---------------------------------------------------------------------------
// Encoding chain
// ---------------------------------------------------------------------------

fn merge_encoding(chain: Option<String>, token: &str) -> Option<String> {
    match chain {
        Some(c) if !c.is_empty() => Some(format!("{c}/{token}")),
        _ => Some(token.to_string()),
    }
}

fn encode_data(
    data: Data,
    encoding: Option<String>,
    cipher: Option<&CipherParams>,
) -> Result<(Option<serde_json::Value>, Option<String>), Error> {
    let mut chain = encoding;
    let text = match data {
        Data::None => return Ok((None, chain)),
        Data::Text(s) => s,
        Data::Binary(b) => {
            chain = merge_encoding(chain, ENC_BASE64);
            base64::engine::general_purpose::STANDARD.encode(b)
        }
        Data::Json(v) => {
            let s = serde_json::to_string(&v)?;
            if !(s.starts_with('[') || s.starts_with('{')) {
                return Err(Error::Encoding(format!(
                    "message data must be a string, bytes, or a JSON object or array; got JSON {s}"
                )));
            }
            chain = merge_encoding(chain, ENC_JSON);
            s
        }
    };

    let Some(cipher) = cipher else {
        return Ok((Some(serde_json::Value::String(text)), chain));
    };

    // The pre-encryption value is a Rust String, hence always valid UTF-8;
    // mark it so the decoder restores text rather than bytes.
    chain = merge_encoding(chain, ENC_UTF8);
    let ciphertext = cipher.encrypt(text.as_bytes())?;
    chain = merge_encoding(chain, &cipher.encoding_token());
    chain = merge_encoding(chain, ENC_BASE64);
    Ok((
        Some(serde_json::Value::String(
            base64::engine::general_purpose::STANDARD.encode(ciphertext),
        )),
        chain,
    ))
}

fn coerce_bytes(data: &Data) -> Result<Vec<u8>, Error> {
    match data {
        Data::Text(s) => Ok(s.as_bytes().to_vec()),
        Data::Binary(b) => Ok(b.clone()),
        other => Err(Error::Encoding(format!(
            "expected a string or binary payload, got {other:?}"
        ))),
    }
}

fn apply_decode_token(
    token: &str,
    data: &Data,
    cipher: Option<&CipherParams>,
) -> Result<Data, Error> {
    match token {
        ENC_BASE64 => {
            let bytes = coerce_bytes(data)?;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(bytes)
                .map_err(|e| Error::Encoding(format!("invalid base64 payload: {e}")))?;
            Ok(Data::Binary(decoded))
        }
        ENC_UTF8 => {
            let bytes = coerce_bytes(data)?;
            let text = String::from_utf8(bytes)
                .map_err(|e| Error::Encoding(format!("payload is not valid UTF-8: {e}")))?;
            Ok(Data::Text(text))
        }
        ENC_JSON => {
            let bytes = coerce_bytes(data)?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Encoding(format!("invalid JSON payload: {e}")))?;
            Ok(Data::Json(value))
        }
        t if t.starts_with(ENC_CIPHER_PREFIX) => {
            let Some(cipher) = cipher else {
                return Err(Error::Crypto(format!(
                    "message data is encrypted as {t}, but no cipher was configured"
                )));
            };
            let bytes = coerce_bytes(data)?;
            Ok(Data::Binary(cipher.decrypt(&bytes)?))
        }
        other => Err(Error::Encoding(format!("unknown encoding {other}"))),
    }
}

/// Unwind an encoding chain right-to-left. On error the partially decoded
/// value and the unconsumed chain are returned alongside the error.
fn decode_data(
    data: Option<serde_json::Value>,
    encoding: Option<String>,
    cipher: Option<&CipherParams>,
) -> (Data, Option<String>, Option<Error>) {
    let current = match data {
        None | Some(serde_json::Value::Null) => return (Data::None, encoding, None),
        Some(serde_json::Value::String(s)) => Data::Text(s),
        // On the JSON protocol, objects and arrays arrive pre-parsed.
        Some(other) => Data::Json(other),
    };

    let tokens: Vec<String> = match encoding {
        Some(e) if !e.is_empty() => e.split('/').map(str::to_string).collect(),
        _ => return (current, None, None),
    };

    let mut current = current;
    let mut remaining = tokens;
    while let Some(token) = remaining.last().cloned() {
        match apply_decode_token(&token, &current, cipher) {
            Ok(next) => {
                current = next;
                remaining.pop();
            }
            Err(err) => {
                let residual = if remaining.is_empty() {
                    None
                } else {
                    Some(remaining.join("/"))
                };
                return (current, residual, Some(err));
            }
        }
    }
    (current, None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CipherParams {
        CipherParams::aes_cbc(vec![0x42; 16]).unwrap()
    }

    fn round_trip(data: Data, cipher: Option<&CipherParams>) -> Data {
        let (wire, encoding) = encode_data(data, None, cipher).unwrap();
        let (decoded, residual, err) = decode_data(wire, encoding, cipher);
        assert!(err.is_none(), "unexpected decode error: {err:?}");
        assert_eq!(residual, None);
        decoded
    }

    #[test]
    fn round_trip_text() {
        let data = Data::Text("hello".into());
        assert_eq!(round_trip(data.clone(), None), data);
        assert_eq!(round_trip(data.clone(), Some(&cipher())), data);
    }

    #[test]
    fn round_trip_empty_text() {
        let data = Data::Text(String::new());
        assert_eq!(round_trip(data.clone(), None), data);
        assert_eq!(round_trip(data.clone(), Some(&cipher())), data);
    }

    #[test]
    fn round_trip_binary() {
        let data = Data::Binary(vec![0, 1, 2, 254, 255]);
        assert_eq!(round_trip(data.clone(), None), data);
        assert_eq!(round_trip(data.clone(), Some(&cipher())), data);
    }

    #[test]
    fn round_trip_empty_binary() {
        let data = Data::Binary(vec![]);
        assert_eq!(round_trip(data.clone(), None), data);
    }

    #[test]
    fn round_trip_json_object_and_array() {
        for data in [
            Data::Json(serde_json::json!({"a": [1, 2], "b": null})),
            Data::Json(serde_json::json!(["x", {"y": 1}])),
        ] {
            assert_eq!(round_trip(data.clone(), None), data);
            assert_eq!(round_trip(data.clone(), Some(&cipher())), data);
        }
    }

    #[test]
    fn round_trip_none() {
        assert_eq!(round_trip(Data::None, None), Data::None);
    }

    #[test]
    fn encode_rejects_scalar_json() {
        for scalar in [
            serde_json::json!(42),
            serde_json::json!("plain"),
            serde_json::json!(true),
            serde_json::json!(null),
        ] {
            let err = encode_data(Data::Json(scalar), None, None).unwrap_err();
            assert!(matches!(err, Error::Encoding(_)), "got {err:?}");
        }
    }

    #[test]
    fn encode_chains() {
        let (_, encoding) = encode_data(Data::Binary(vec![1, 2]), None, None).unwrap();
        assert_eq!(encoding.as_deref(), Some("base64"));

        let (_, encoding) =
            encode_data(Data::Json(serde_json::json!({"a": 1})), None, None).unwrap();
        assert_eq!(encoding.as_deref(), Some("json"));

        let (_, encoding) = encode_data(Data::Text("hi".into()), None, Some(&cipher())).unwrap();
        assert_eq!(encoding.as_deref(), Some("utf-8/cipher+aes-128-cbc/base64"));

        let (_, encoding) = encode_data(Data::Binary(vec![1]), None, Some(&cipher())).unwrap();
        assert_eq!(
            encoding.as_deref(),
            Some("base64/utf-8/cipher+aes-128-cbc/base64")
        );

        let (_, encoding) =
            encode_data(Data::Json(serde_json::json!([1])), None, Some(&cipher())).unwrap();
        assert_eq!(
            encoding.as_deref(),
            Some("json/utf-8/cipher+aes-128-cbc/base64")
        );
    }

    #[test]
    fn decode_json_protocol_object_without_encoding() {
        let (data, residual, err) =
            decode_data(Some(serde_json::json!({"k": "v"})), None, None);
        assert!(err.is_none());
        assert_eq!(residual, None);
        assert_eq!(data, Data::Json(serde_json::json!({"k": "v"})));
    }

    #[test]
    fn decode_unknown_token_retains_partial() {
        // The inner base64 decodes; the unknown outer token stops the walk
        // with the partially decoded value and the residual chain intact.
        let payload = base64::engine::general_purpose::STANDARD.encode(b"bytes");
        let (data, residual, err) = decode_data(
            Some(serde_json::Value::String(payload)),
            Some("vcdiff/base64".into()),
            None,
        );
        assert!(matches!(err, Some(Error::Encoding(_))));
        assert_eq!(residual.as_deref(), Some("vcdiff"));
        assert_eq!(data, Data::Binary(b"bytes".to_vec()));
    }

    #[test]
    fn decode_cipher_without_key_retains_payload() {
        let c = cipher();
        let (wire, encoding) =
            encode_data(Data::Text("secret".into()), None, Some(&c)).unwrap();
        let (data, residual, err) = decode_data(wire, encoding, None);
        assert!(matches!(err, Some(Error::Crypto(_))));
        // base64 was unwound; the cipher and utf-8 tokens remain.
        assert_eq!(residual.as_deref(), Some("utf-8/cipher+aes-128-cbc"));
        assert!(matches!(data, Data::Binary(_)));
    }

    #[test]
    fn decode_invalid_base64_errors() {
        let (_, _, err) = decode_data(
            Some(serde_json::Value::String("!!not-base64!!".into())),
            Some("base64".into()),
            None,
        );
        assert!(matches!(err, Some(Error::Encoding(_))));
    }

    #[test]
    fn large_payload_round_trips() {
        let data = Data::Binary(vec![0xAB; 1 << 20]);
        assert_eq!(round_trip(data.clone(), Some(&cipher())), data);
    }

    #[test]
    fn message_update_empty_fields() {
        let mut msg = Message::new("e", "x");
        msg.update_empty_fields(Some("frame-1"), Some("conn-1"), Some(1000), 2);
        assert_eq!(msg.id.as_deref(), Some("frame-1:2"));
        assert_eq!(msg.connection_id.as_deref(), Some("conn-1"));
        assert_eq!(msg.timestamp, Some(1000));

        // Existing values are kept.
        msg.update_empty_fields(Some("frame-2"), Some("conn-2"), Some(2000), 0);
        assert_eq!(msg.id.as_deref(), Some("frame-1:2"));
        assert_eq!(msg.connection_id.as_deref(), Some("conn-1"));
        assert_eq!(msg.timestamp, Some(1000));
    }

    #[test]
    fn presence_member_key() {
        let msg = PresenceMessage {
            action: PresenceAction::Enter,
            id: None,
            client_id: Some("alice".into()),
            connection_id: Some("conn-9".into()),
            data: Data::None,
            encoding: None,
            timestamp: None,
        };
        assert_eq!(msg.member_key(), "alice:conn-9");
    }

    #[test]
    fn presence_round_trip() {
        let msg = PresenceMessage {
            action: PresenceAction::Update,
            id: Some("conn:1:0".into()),
            client_id: Some("alice".into()),
            connection_id: Some("conn".into()),
            data: Data::Json(serde_json::json!({"status": "busy"})),
            encoding: None,
            timestamp: Some(123),
        };
        let wire = msg.encoded(None).unwrap();
        let (decoded, err) = PresenceMessage::from_wire(wire, None);
        assert!(err.is_none());
        assert_eq!(decoded, msg);
    }
}
