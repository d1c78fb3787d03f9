use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The only shape a container is permitted to emit. Identity fields
/// (`id`, `version`, `type`, `source`, `group`, `timestamp`) must never
/// appear here — a container that sends them is rejected at router stage 2,
/// before a `WireMessage` is even constructed from the raw frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub topic: String,
    pub correlation: Uuid,
    pub arguments: serde_json::Value,
}

/// The exact set of envelope identity fields a wire frame must never carry.
/// Used by the router's stage-2 wire-format isolation check.
pub const ENVELOPE_IDENTITY_FIELDS: &[&str] = &["id", "version", "type", "source", "group", "timestamp"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let msg = WireMessage {
            topic: "tool.invoke.echo".into(),
            correlation: Uuid::new_v4(),
            arguments: serde_json::json!({"text": "hi"}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.topic, msg.topic);
        assert_eq!(back.correlation, msg.correlation);
    }
}
