use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const MAX_FIELD_LENGTH: usize = 255;
/// Collision resistance guard: shorter ids are rejected outright.
pub const MIN_EVENT_ID_LENGTH: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} cannot be empty or whitespace only")]
    EmptyField(&'static str),
    #[error("{0} cannot be longer than {MAX_FIELD_LENGTH} characters")]
    FieldTooLong(&'static str),
    #[error("event_id must be at least {MIN_EVENT_ID_LENGTH} characters")]
    EventIdTooShort,
}

/// A producer-submitted event. `timestamp` is producer-supplied; the store
/// separately records when the event was received and when the dedup
/// decision was made.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub topic: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Trim the identifying fields and check them against the ingest
    /// contract. Trimming happens first so that a whitespace-padded id and
    /// its bare form deduplicate to the same key.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        self.topic = self.topic.trim().to_string();
        self.event_id = self.event_id.trim().to_string();
        self.source = self.source.trim().to_string();

        for (name, value) in [
            ("topic", &self.topic),
            ("event_id", &self.event_id),
            ("source", &self.source),
        ] {
            if value.is_empty() {
                return Err(ValidationError::EmptyField(name));
            }
            if value.len() > MAX_FIELD_LENGTH {
                return Err(ValidationError::FieldTooLong(name));
            }
        }

        if self.event_id.len() < MIN_EVENT_ID_LENGTH {
            return Err(ValidationError::EventIdTooShort);
        }

        Ok(())
    }
}

/// A queue entry as serialised onto the broker: the event object itself,
/// plus broker-reserved top-level keys prefixed with an underscore.
/// Producers must not use underscore-prefixed keys of their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedEvent {
    #[serde(flatten)]
    pub event: Event,
    #[serde(rename = "_retries", default)]
    pub retries: u32,
}

impl QueuedEvent {
    pub fn new(event: Event) -> Self {
        Self { event, retries: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> Event {
        Event {
            topic: "application-logs".to_string(),
            event_id: "evt-550e8400".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 12, 4, 10, 30, 0).unwrap(),
            source: "service-a".to_string(),
            payload: Map::new(),
        }
    }

    #[test]
    fn valid_event_passes() {
        let mut event = sample_event();
        assert_eq!(event.validate(), Ok(()));
    }

    #[test]
    fn fields_are_trimmed() {
        let mut event = sample_event();
        event.topic = "  application-logs  ".to_string();
        event.event_id = " evt-550e8400 ".to_string();
        event.source = "\tservice-a\n".to_string();

        event.validate().expect("trimmed event should be valid");

        assert_eq!(event.topic, "application-logs");
        assert_eq!(event.event_id, "evt-550e8400");
        assert_eq!(event.source, "service-a");
    }

    #[test]
    fn whitespace_only_fields_are_rejected() {
        let mut event = sample_event();
        event.topic = "   ".to_string();
        assert_eq!(event.validate(), Err(ValidationError::EmptyField("topic")));

        let mut event = sample_event();
        event.source = "\t\n".to_string();
        assert_eq!(event.validate(), Err(ValidationError::EmptyField("source")));
    }

    #[test]
    fn event_id_length_boundary() {
        let mut event = sample_event();
        event.event_id = "a".repeat(7);
        assert_eq!(event.validate(), Err(ValidationError::EventIdTooShort));

        let mut event = sample_event();
        event.event_id = "a".repeat(8);
        assert_eq!(event.validate(), Ok(()));
    }

    #[test]
    fn overlong_fields_are_rejected() {
        let mut event = sample_event();
        event.topic = "t".repeat(256);
        assert_eq!(event.validate(), Err(ValidationError::FieldTooLong("topic")));

        let mut event = sample_event();
        event.topic = "t".repeat(255);
        assert_eq!(event.validate(), Ok(()));
    }

    #[test]
    fn payload_defaults_to_empty_object() {
        let event: Event = serde_json::from_str(
            r#"{
                "topic": "t",
                "event_id": "abcd1234",
                "timestamp": "2024-12-04T10:30:00Z",
                "source": "s"
            }"#,
        )
        .expect("event without payload should deserialize");

        assert!(event.payload.is_empty());
    }

    #[test]
    fn timestamp_accepts_offset_and_zulu() {
        let zulu: Event = serde_json::from_str(
            r#"{"topic":"t","event_id":"abcd1234","timestamp":"2024-12-04T10:30:00Z","source":"s"}"#,
        )
        .unwrap();
        let offset: Event = serde_json::from_str(
            r#"{"topic":"t","event_id":"abcd1234","timestamp":"2024-12-04T17:30:00+07:00","source":"s"}"#,
        )
        .unwrap();

        assert_eq!(zulu.timestamp, offset.timestamp);
    }

    #[test]
    fn queued_event_wire_format() {
        let queued = QueuedEvent {
            event: sample_event(),
            retries: 2,
        };

        let wire = serde_json::to_value(&queued).unwrap();
        assert_eq!(wire["topic"], "application-logs");
        assert_eq!(wire["_retries"], 2);

        let decoded: QueuedEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded, queued);
    }

    #[test]
    fn queued_event_retries_default_to_zero() {
        let decoded: QueuedEvent = serde_json::from_str(
            r#"{"topic":"t","event_id":"abcd1234","timestamp":"2024-12-04T10:30:00Z","source":"s","payload":{}}"#,
        )
        .unwrap();

        assert_eq!(decoded.retries, 0);
    }
}
