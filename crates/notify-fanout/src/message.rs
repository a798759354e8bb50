//! Notification wire model

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Loosely-typed metadata attached to a notification.
///
/// Values are arbitrary JSON; consumers decode them defensively.
pub type NotificationData = HashMap<String, serde_json::Value>;

/// The unit of delivery.
///
/// Serialized once at publish time and never mutated afterwards. The `id`
/// travels with every publish so consumers can drop the rare duplicate caused
/// by a retried publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<NotificationData>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NotificationMessage {
    /// Create a notification with a fresh id and the current time
    pub fn new(
        user_id: impl Into<String>,
        kind: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            kind: kind.into(),
            title: title.into(),
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
            is_read: false,
            expires_at: None,
        }
    }

    /// Set the notification id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a metadata entry
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Set the expiry
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check required fields, naming the first one that is missing
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("id", &self.id),
            ("user_id", &self.user_id),
            ("type", &self.kind),
            ("title", &self.title),
            ("message", &self.message),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(ValidationError::MissingField(field));
            }
        }
        // The Unix epoch is the default, unset timestamp
        if self.timestamp == DateTime::<Utc>::UNIX_EPOCH {
            return Err(ValidationError::MissingField("timestamp"));
        }
        Ok(())
    }

    /// Whether the notification has passed its expiry
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Encode to the JSON wire format
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from the JSON wire format
    pub fn from_json(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> NotificationMessage {
        NotificationMessage::new("42", "INFO", "Hi", "Test")
            .with_id("n1")
            .with_timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn valid_message_passes() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn each_missing_field_is_named() {
        let cases: [(&str, fn(&mut NotificationMessage)); 5] = [
            ("id", |m| m.id.clear()),
            ("user_id", |m| m.user_id.clear()),
            ("type", |m| m.kind.clear()),
            ("title", |m| m.title.clear()),
            ("message", |m| m.message.clear()),
        ];
        for (field, clear) in cases {
            let mut msg = sample();
            clear(&mut msg);
            assert_eq!(msg.validate(), Err(ValidationError::MissingField(field)));
        }
    }

    #[test]
    fn zero_timestamp_is_rejected() {
        let msg = sample().with_timestamp(DateTime::<Utc>::default());
        assert_eq!(msg.validate(), Err(ValidationError::MissingField("timestamp")));
    }

    #[test]
    fn whitespace_and_pre_epoch_values_are_present() {
        let mut msg = sample().with_timestamp(Utc.with_ymd_and_hms(1969, 7, 20, 20, 17, 0).unwrap());
        msg.title = " ".to_string();
        assert_eq!(msg.validate(), Ok(()));
    }

    #[test]
    fn wire_format_uses_type_and_omits_defaults() {
        let json: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "INFO");
        assert_eq!(json["timestamp"], "2024-05-01T12:00:00Z");
        assert!(json.get("data").is_none());
        assert!(json.get("is_read").is_none());
        assert!(json.get("expires_at").is_none());
    }

    #[test]
    fn decodes_optional_fields() {
        let payload = r#"{"id":"n2","user_id":"7","type":"ALERT","title":"t","message":"m",
            "data":{"count":3},"timestamp":"2024-05-01T12:00:00Z","is_read":true,
            "expires_at":"2024-05-02T12:00:00Z"}"#;
        let msg = NotificationMessage::from_json(payload).unwrap();
        assert!(msg.is_read);
        assert_eq!(msg.data.as_ref().unwrap()["count"], 3);
        assert!(msg.is_expired_at(Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap()));
    }
}
