use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name carrying device connectivity and emergency state.
pub const STATUS_EVENT: &str = "status";
/// Event name carrying the device's latest location fix.
pub const LOCATION_EVENT: &str = "location";

/// Wire envelope exchanged in both directions: an event name plus an
/// untyped JSON payload.
///
/// Payloads are validated by the consumer; an envelope with an unknown event
/// name is delivered to whichever handlers registered for it (usually none).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Typed payload of a `status` event.
///
/// Both fields are optional on the wire; absent fields leave the telemetry
/// snapshot untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEventMsg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency: Option<bool>,
}

/// Typed payload of a `location` event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LocationEventMsg {
    pub lat: f64,
    pub lng: f64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_round_trip() {
        let envelope = EventEnvelope::new(
            STATUS_EVENT,
            json!({"status": "online", "emergency": false}),
        );
        let encoded = envelope.to_text().expect("encode");
        let decoded = EventEnvelope::from_text(&encoded).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn envelope_without_data_defaults_to_null() {
        let decoded = EventEnvelope::from_text(r#"{"event":"ping"}"#).expect("decode");
        assert_eq!(decoded.event, "ping");
        assert_eq!(decoded.data, serde_json::Value::Null);
    }

    #[test]
    fn status_payload_tolerates_partial_fields() {
        let decoded: StatusEventMsg =
            serde_json::from_value(json!({"emergency": true})).expect("decode");
        assert_eq!(decoded.status, None);
        assert_eq!(decoded.emergency, Some(true));
    }
}
