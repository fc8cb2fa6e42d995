//! The `Message` envelope: a single JSON object carrying either a chat
//! message or an acknowledgment.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EnvelopeError;

/// Content longer than this is rejected at construction time (spec.md §3).
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Message,
    Acknowledgment,
}

/// A peer channel preference as carried inside an acknowledgment's
/// `channelPreferences` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreference {
    pub protocol: String,
    #[serde(rename = "preferenceOrder", skip_serializing_if = "Option::is_none")]
    pub preference_order: Option<u32>,
    #[serde(rename = "cannotUse")]
    pub cannot_use: bool,
}

/// A chat message or acknowledgment, serialized on the wire as a single
/// JSON object (spec.md §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    pub timestamp: i64,
    #[serde(rename = "fromMagnetLink")]
    pub from_magnet_link: String,
    #[serde(rename = "ackOfUuid", skip_serializing_if = "Option::is_none")]
    pub ack_of_uuid: Option<String>,
    #[serde(rename = "receivedVia", skip_serializing_if = "Option::is_none")]
    pub received_via: Option<String>,
    #[serde(
        rename = "channelPreferences",
        skip_serializing_if = "Option::is_none"
    )]
    pub channel_preferences: Option<Vec<ChannelPreference>>,
}

impl Message {
    /// Construct a new chat message, timestamped with `now()`.
    pub fn new_text(content: impl Into<String>, from_magnet_link: impl Into<String>) -> Result<Self, EnvelopeError> {
        let content = content.into();
        if content.len() > MAX_CONTENT_BYTES {
            return Err(EnvelopeError::ContentTooLarge(content.len()));
        }
        Ok(Message {
            uuid: Uuid::new_v4().to_string(),
            kind: MessageType::Message,
            content,
            timestamp: now_millis(),
            from_magnet_link: from_magnet_link.into(),
            ack_of_uuid: None,
            received_via: None,
            channel_preferences: None,
        })
    }

    pub fn is_acknowledgment(&self) -> bool {
        self.kind == MessageType::Acknowledgment
    }

    /// Serialize to a single JSON object.
    pub fn serialize(&self) -> Vec<u8> {
        // Construction enforces UTF-8 and the size cap, so this cannot fail.
        serde_json::to_vec(self).expect("Message always serializes")
    }

    /// Deserialize from bytes. Returns `None` (a failure sentinel, not an
    /// exception) on malformed input — unknown fields are tolerated.
    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Build an acknowledgment for `original`, received via `received_via`.
///
/// `content` is the stable string `"ACK: " + ackOfUuid` so it can be used as
/// a fallback correlator even if `ackOfUuid` parsing ever fails downstream.
pub fn create_acknowledgment(
    original: &Message,
    received_via: impl Into<String>,
    self_magnet_link: impl Into<String>,
    channel_preferences: Vec<ChannelPreference>,
) -> Message {
    Message {
        uuid: Uuid::new_v4().to_string(),
        kind: MessageType::Acknowledgment,
        content: format!("ACK: {}", original.uuid),
        timestamp: now_millis(),
        from_magnet_link: self_magnet_link.into(),
        ack_of_uuid: Some(original.uuid.clone()),
        received_via: Some(received_via.into()),
        channel_preferences: if channel_preferences.is_empty() {
            None
        } else {
            Some(channel_preferences)
        },
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_text_rejects_oversized_content() {
        let big = "x".repeat(MAX_CONTENT_BYTES + 1);
        assert_eq!(
            Message::new_text(big, "magnet:?x").unwrap_err(),
            EnvelopeError::ContentTooLarge(MAX_CONTENT_BYTES + 1)
        );
    }

    #[test]
    fn uuid_is_lowercase_hyphenated() {
        let msg = Message::new_text("hi", "magnet:?x").unwrap();
        assert_eq!(msg.uuid, msg.uuid.to_lowercase());
        assert_eq!(msg.uuid.matches('-').count(), 4);
    }

    #[test]
    fn serialize_deserialize_round_trips() {
        let msg = Message::new_text("hello", "magnet:?x").unwrap();
        let bytes = msg.serialize();
        let back = Message::deserialize(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn deserialize_returns_none_on_malformed_input() {
        assert!(Message::deserialize(b"not json at all").is_none());
        assert!(Message::deserialize(b"{\"uuid\": 5}").is_none());
    }

    #[test]
    fn deserialize_tolerates_unknown_fields() {
        let json = br#"{"uuid":"abc","type":"message","content":"hi",
            "timestamp":1,"fromMagnetLink":"m","futureField":true}"#;
        let msg = Message::deserialize(json).unwrap();
        assert_eq!(msg.content, "hi");
    }

    #[test]
    fn create_acknowledgment_content_is_stable_ack_string() {
        let original = Message::new_text("hi", "magnet:?a").unwrap();
        let ack = create_acknowledgment(&original, "nostr", "magnet:?b", vec![]);
        assert_eq!(ack.content, format!("ACK: {}", original.uuid));
        assert_eq!(ack.ack_of_uuid.as_deref(), Some(original.uuid.as_str()));
        assert!(ack.is_acknowledgment());
    }

    #[test]
    fn create_acknowledgment_carries_channel_preferences() {
        let original = Message::new_text("hi", "magnet:?a").unwrap();
        let prefs = vec![ChannelPreference {
            protocol: "nostr".into(),
            preference_order: Some(1),
            cannot_use: false,
        }];
        let ack = create_acknowledgment(&original, "nostr", "magnet:?b", prefs.clone());
        assert_eq!(ack.channel_preferences, Some(prefs));
    }

    #[test]
    fn create_acknowledgment_omits_empty_channel_preferences() {
        let original = Message::new_text("hi", "magnet:?a").unwrap();
        let ack = create_acknowledgment(&original, "nostr", "magnet:?b", vec![]);
        assert!(ack.channel_preferences.is_none());
    }

    #[test]
    fn wire_format_uses_camel_case_field_names() {
        let original = Message::new_text("hi", "magnet:?a").unwrap();
        let ack = create_acknowledgment(&original, "mqtt", "magnet:?b", vec![]);
        let json = String::from_utf8(ack.serialize()).unwrap();
        assert!(json.contains("\"ackOfUuid\""));
        assert!(json.contains("\"receivedVia\""));
        assert!(json.contains("\"fromMagnetLink\""));
    }
}
