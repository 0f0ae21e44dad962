//! Duplex channel wire protocol
//!
//! Every frame on the channel is a JSON envelope `{ "type": ..., "data": ... }`.
//! The envelope is modelled as a tagged union: the `type` string selects the
//! variant and the shape of `data` is fixed per variant, so a frame either
//! decodes into exactly one [`Message`] or fails with a [`DecodeError`].
//!
//! # Examples
//!
//! ```
//! use sdk::protocol::Message;
//!
//! let msg = Message::decode(r#"{"type":"input:text","data":{"text":"Hello"}}"#).unwrap();
//! assert_eq!(msg.kind(), "input:text");
//!
//! let wire = Message::error("Failed to process message").encode().unwrap();
//! assert!(wire.contains(r#""type":"error""#));
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::errors::EngineError;

/// Every `type` value the protocol understands
pub const KINDS: [&str; 9] = [
    "connected",
    "ping",
    "pong",
    "input:text",
    "input:voice",
    "ai_response",
    "module:authenticate",
    "module:authenticated",
    "error",
];

const VOICE_KIND: &str = "input:voice";

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    /// Sent by the server right after a connection is accepted.
    #[serde(rename = "connected")]
    Connected(Connected),
    /// Keepalive request.
    #[serde(rename = "ping")]
    Ping(Ping),
    /// Keepalive reply.
    #[serde(rename = "pong")]
    Pong(Pong),
    /// A typed user utterance.
    #[serde(rename = "input:text")]
    InputText(TextInput),
    /// A voice utterance; the payload is passed through untouched.
    #[serde(rename = "input:voice")]
    InputVoice(serde_json::Value),
    /// The agent's reply to an utterance.
    #[serde(rename = "ai_response")]
    AiResponse(AiResponse),
    /// Client asks to be authenticated.
    #[serde(rename = "module:authenticate")]
    Authenticate(Authenticate),
    /// Server answer to `module:authenticate`.
    #[serde(rename = "module:authenticated")]
    Authenticated(Authenticated),
    /// Diagnostic sent instead of a reply.
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connected {
    pub message: String,
    pub timestamp: i64,
    pub features: Features,
}

/// Feature flags advertised in the `connected` greeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features {
    pub voice: bool,
    pub memory: bool,
    pub openai: bool,
    pub gemini: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextInput {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: String,
    pub timestamp: i64,
    pub metadata: ResponseMetadata,
}

/// Provenance attached to every `ai_response`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_stats: Option<MemoryStats>,
}

/// Short-term / long-term memory counts for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub short_term: u64,
    pub long_term: u64,
    pub total: u64,
}

impl MemoryStats {
    /// Build stats from the two tier counts; `total` is always their sum.
    pub fn new(short_term: u64, long_term: u64) -> Self {
        Self {
            short_term,
            long_term,
            total: short_term + long_term,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Authenticate {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticated {
    pub authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Why an inbound frame could not be turned into a [`Message`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not JSON, not an envelope, or a payload of the wrong shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A well-formed envelope whose `type` this protocol does not define.
    #[error("unknown message type: {0}")]
    UnknownKind(String),
}

impl From<DecodeError> for EngineError {
    fn from(err: DecodeError) -> Self {
        EngineError::Decode(err.to_string())
    }
}

impl Message {
    /// The wire `type` string of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connected(_) => "connected",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::InputText(_) => "input:text",
            Message::InputVoice(_) => VOICE_KIND,
            Message::AiResponse(_) => "ai_response",
            Message::Authenticate(_) => "module:authenticate",
            Message::Authenticated(_) => "module:authenticated",
            Message::Error(_) => "error",
        }
    }

    /// Serialize to the JSON envelope.
    pub fn encode(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON envelope.
    ///
    /// A missing or `null` `data` field is read as an empty object, so
    /// `{"type":"ping"}` is a valid ping.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let mut value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let envelope = value
            .as_object_mut()
            .ok_or_else(|| DecodeError::Malformed("envelope is not an object".to_string()))?;

        let kind = envelope
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DecodeError::Malformed("missing string field `type`".to_string()))?
            .to_string();

        if !KINDS.contains(&kind.as_str()) {
            return Err(DecodeError::UnknownKind(kind));
        }

        let data_missing = envelope.get("data").map_or(true, |d| d.is_null());
        if data_missing {
            let filler = if kind == VOICE_KIND {
                serde_json::Value::Null
            } else {
                serde_json::Value::Object(serde_json::Map::new())
            };
            envelope.insert("data".to_string(), filler);
        }

        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Ping stamped with the current time.
    pub fn ping_now() -> Self {
        Message::Ping(Ping {
            timestamp: Some(now_millis()),
        })
    }

    /// Pong stamped with the current time.
    pub fn pong_now() -> Self {
        Message::Pong(Pong {
            timestamp: now_millis(),
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Message::InputText(TextInput { text: text.into() })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error(ErrorPayload {
            message: message.into(),
        })
    }
}

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn samples() -> Vec<Message> {
        vec![
            Message::Connected(Connected {
                message: "Connected to AIRI Backend".into(),
                timestamp: 1_700_000_000_000,
                features: Features {
                    voice: true,
                    memory: true,
                    openai: false,
                    gemini: true,
                },
            }),
            Message::Ping(Ping { timestamp: None }),
            Message::ping_now(),
            Message::pong_now(),
            Message::text("Hello"),
            Message::InputVoice(json!({"audio": "AAAA", "format": "webm"})),
            Message::InputVoice(serde_json::Value::Null),
            Message::AiResponse(AiResponse {
                content: "hi".into(),
                timestamp: 42,
                metadata: ResponseMetadata {
                    provider: "openai".into(),
                    model: Some("gpt-4".into()),
                    transcription: None,
                    memory_stats: Some(MemoryStats::new(2, 1)),
                },
            }),
            Message::Authenticate(Authenticate {}),
            Message::Authenticated(Authenticated {
                authenticated: true,
            }),
            Message::error("Failed to process message"),
        ]
    }

    #[test]
    fn test_every_kind_round_trips() {
        for msg in samples() {
            let wire = msg.encode().unwrap();
            let back = Message::decode(&wire).unwrap();
            assert_eq!(back, msg, "round trip failed for {}", msg.kind());
        }
    }

    #[test]
    fn test_kind_matches_wire_type() {
        for msg in samples() {
            let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
            assert_eq!(value["type"], msg.kind());
        }
    }

    #[test]
    fn test_ping_without_data() {
        let msg = Message::decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, Message::Ping(Ping { timestamp: None }));
    }

    #[test]
    fn test_authenticate_wire_names() {
        let msg = Message::decode(r#"{"type":"module:authenticate","data":{}}"#).unwrap();
        assert_eq!(msg, Message::Authenticate(Authenticate {}));

        let wire = Message::Authenticated(Authenticated {
            authenticated: true,
        })
        .encode()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(
            value,
            json!({"type": "module:authenticated", "data": {"authenticated": true}})
        );
    }

    #[test]
    fn test_memory_stats_are_camel_case() {
        let meta = ResponseMetadata {
            provider: "openai".into(),
            model: None,
            transcription: None,
            memory_stats: Some(MemoryStats::new(3, 4)),
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            value,
            json!({"provider": "openai", "memoryStats": {"shortTerm": 3, "longTerm": 4, "total": 7}})
        );
    }

    #[test]
    fn test_malformed_inputs() {
        for bad in [
            "not json",
            "[1,2,3]",
            r#"{"data":{}}"#,
            r#"{"type":42}"#,
            r#"{"type":"input:text","data":{"txt":"oops"}}"#,
            r#"{"type":"pong","data":{}}"#,
        ] {
            assert!(
                matches!(Message::decode(bad), Err(DecodeError::Malformed(_))),
                "expected malformed: {bad}"
            );
        }
    }

    #[test]
    fn test_unknown_kind() {
        let err = Message::decode(r#"{"type":"dance","data":{}}"#).unwrap_err();
        assert_eq!(err, DecodeError::UnknownKind("dance".into()));
    }
}
