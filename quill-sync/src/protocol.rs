//! Client wire protocol and the bus change event.
//!
//! Client frames are JSON text messages on the WebSocket:
//! ```text
//! { "event": "text-change", "data": { "text": "...", "cursorPosition": 3 } }
//! { "event": "receive-text", "data": { "text": "..." } }
//! ```
//!
//! `ChangeEvent` travels between workers over the bus and is encoded with
//! bincode, the same way the hub frames are.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Edit payload of `text-change`.
///
/// Accepts both `{text, cursorPosition}` and a bare string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TextPayload")]
pub struct TextChange {
    pub text: String,
    #[serde(rename = "cursorPosition", skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<u64>,
}

impl TextChange {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cursor_position: None,
        }
    }

    pub fn with_cursor(text: impl Into<String>, cursor_position: u64) -> Self {
        Self {
            text: text.into(),
            cursor_position: Some(cursor_position),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextPayload {
    Object {
        text: String,
        #[serde(rename = "cursorPosition", default)]
        cursor_position: Option<u64>,
    },
    Raw(String),
}

impl From<TextPayload> for TextChange {
    fn from(payload: TextPayload) -> Self {
        match payload {
            TextPayload::Object {
                text,
                cursor_position,
            } => Self {
                text,
                cursor_position,
            },
            TextPayload::Raw(text) => Self::new(text),
        }
    }
}

/// Payload of `save-text`. The timestamp is optional on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SavePayload")]
pub struct SaveText {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SavePayload {
    Object {
        text: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Raw(String),
}

impl From<SavePayload> for SaveText {
    fn from(payload: SavePayload) -> Self {
        match payload {
            SavePayload::Object { text, timestamp } => Self { text, timestamp },
            SavePayload::Raw(text) => Self {
                text,
                timestamp: None,
            },
        }
    }
}

/// Events a client sends to its worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Local edit; carries the full new text.
    TextChange(TextChange),
    /// Presence hint, not part of the document.
    CursorMove(u64),
    /// Durability hint for the audit slot.
    SaveText(SaveText),
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| SyncError::Protocol(format!("bad client frame: {e}")))
    }

    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TextChange(_) => "text-change",
            Self::CursorMove(_) => "cursor-move",
            Self::SaveText(_) => "save-text",
        }
    }
}

/// Events a worker sends to its clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full snapshot to render.
    ReceiveText { text: String },
    /// Presence display.
    UserCount { count: u64, typing: bool },
    /// Non-fatal notice.
    Error(String),
}

impl ServerMessage {
    pub fn receive_text(text: impl Into<String>) -> Self {
        Self::ReceiveText { text: text.into() }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| SyncError::Protocol(format!("bad server frame: {e}")))
    }
}

/// A full-state snapshot published on the bus after a local edit.
///
/// Receivers apply it unconditionally; there is no sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub text: String,
    /// Cursor hint from the editing client. Ignored when applying.
    pub cursor_position: Option<u64>,
    /// Worker that published the event.
    pub origin: Uuid,
    /// Connection that produced the edit.
    pub connection_id: Uuid,
}

impl ChangeEvent {
    pub fn new(origin: Uuid, connection_id: Uuid, change: TextChange) -> Self {
        Self {
            text: change.text,
            cursor_position: change.cursor_position,
            origin,
            connection_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_change_object_form() {
        let msg = ClientMessage::decode(
            r#"{"event":"text-change","data":{"text":"hello","cursorPosition":5}}"#,
        )
        .unwrap();
        assert_eq!(msg, ClientMessage::TextChange(TextChange::with_cursor("hello", 5)));
        assert_eq!(msg.name(), "text-change");
    }

    #[test]
    fn test_text_change_raw_string_form() {
        let msg = ClientMessage::decode(r#"{"event":"text-change","data":"hi there"}"#).unwrap();
        assert_eq!(msg, ClientMessage::TextChange(TextChange::new("hi there")));
    }

    #[test]
    fn test_text_change_without_cursor() {
        let msg = ClientMessage::decode(r#"{"event":"text-change","data":{"text":""}}"#).unwrap();
        assert_eq!(msg, ClientMessage::TextChange(TextChange::new("")));
    }

    #[test]
    fn test_cursor_move() {
        let msg = ClientMessage::decode(r#"{"event":"cursor-move","data":42}"#).unwrap();
        assert_eq!(msg, ClientMessage::CursorMove(42));
    }

    #[test]
    fn test_save_text_forms() {
        let full = ClientMessage::decode(
            r#"{"event":"save-text","data":{"text":"a","timestamp":"2024-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(
            full,
            ClientMessage::SaveText(SaveText {
                text: "a".into(),
                timestamp: Some("2024-01-01T00:00:00Z".into()),
            })
        );

        let raw = ClientMessage::decode(r#"{"event":"save-text","data":"b"}"#).unwrap();
        assert_eq!(
            raw,
            ClientMessage::SaveText(SaveText {
                text: "b".into(),
                timestamp: None,
            })
        );
    }

    #[test]
    fn test_client_encode_uses_camel_case_cursor() {
        let json = ClientMessage::TextChange(TextChange::with_cursor("x", 1))
            .encode()
            .unwrap();
        assert_eq!(
            json,
            r#"{"event":"text-change","data":{"text":"x","cursorPosition":1}}"#
        );
    }

    #[test]
    fn test_unknown_event_rejected() {
        let err = ClientMessage::decode(r#"{"event":"delete-all","data":null}"#).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(ClientMessage::decode("not json").is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        assert_eq!(
            ServerMessage::receive_text("hello").encode().unwrap(),
            r#"{"event":"receive-text","data":{"text":"hello"}}"#
        );
        assert_eq!(
            ServerMessage::UserCount {
                count: 3,
                typing: true
            }
            .encode()
            .unwrap(),
            r#"{"event":"user-count","data":{"count":3,"typing":true}}"#
        );
        assert_eq!(
            ServerMessage::Error("oops".into()).encode().unwrap(),
            r#"{"event":"error","data":"oops"}"#
        );
    }

    #[test]
    fn test_server_message_decode() {
        let msg = ServerMessage::decode(r#"{"event":"receive-text","data":{"text":""}}"#).unwrap();
        assert_eq!(msg, ServerMessage::receive_text(""));
    }

    #[test]
    fn test_change_event_bincode() {
        let event = ChangeEvent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            TextChange::with_cursor("snapshot", 8),
        );
        let decoded = ChangeEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_change_event_decode_garbage() {
        assert!(ChangeEvent::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }
}
