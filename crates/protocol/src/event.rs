use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::EventType;

/// Payload of an [`EventType::UnreadCount`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCountPayload {
    pub count: i64,
}

/// Envelope for every realtime event, inbound and outbound.
///
/// The `payload` field uses `serde_json::value::RawValue` so the hub can
/// forward it without knowing the variant-specific shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
}

impl Event {
    /// Creates an event of the given type with every optional field unset.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            chat_id: None,
            message_id: None,
            user_id: None,
            timestamp: None,
            payload: None,
        }
    }

    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attaches a serialized payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(payload)?;
        self.payload = Some(serde_json::value::RawValue::from_string(json)?);
        Ok(self)
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Chat id, treating an empty string as absent.
    pub fn chat_id(&self) -> Option<&str> {
        non_empty(self.chat_id.as_deref())
    }

    /// Message id, treating an empty string as absent.
    pub fn message_id(&self) -> Option<&str> {
        non_empty(self.message_id.as_deref())
    }

    /// User id, treating an empty string as absent.
    pub fn user_id(&self) -> Option<&str> {
        non_empty(self.user_id.as_deref())
    }

    /// Returns `true` if the timestamp is missing or the zero time.
    ///
    /// Clients built on Go's `time.Time` send `0001-01-01T00:00:00Z` when
    /// the field was never set.
    pub fn timestamp_unset(&self) -> bool {
        self.timestamp.is_none_or(|ts| ts.year() <= 1)
    }

    /// Fills an unset timestamp with `now`. Set timestamps are kept.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        if self.timestamp_unset() {
            self.timestamp = Some(now);
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
