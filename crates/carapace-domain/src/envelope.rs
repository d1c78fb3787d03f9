use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorPayload;

/// A tenancy/routing key. Every session, event, tool call, and audit entry
/// belongs to exactly one group; cross-group reads are never permitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Group(pub String);

impl Group {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Group {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Group {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The core-canonical message published on the event bus. Identity fields
/// (`id`, `version`, `kind`, `source`, `group`, `timestamp`) are always
/// filled from trusted core state, never from an untrusted wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub version: u8,
    pub kind: EnvelopeKind,
    pub topic: String,
    pub source: String,
    pub correlation: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub group: Group,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Event,
    Request,
    Response,
}

impl EventEnvelope {
    /// Construct a new core-originated event. `correlation` is `None` for
    /// events published outside a request/response exchange.
    pub fn new_event(topic: impl Into<String>, source: impl Into<String>, group: Group, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            kind: EnvelopeKind::Event,
            topic: topic.into(),
            source: source.into(),
            correlation: None,
            timestamp: Utc::now(),
            group,
            payload,
        }
    }
}

/// Built by the router from a `WireMessage` plus the session's trusted
/// identity. Immutable once constructed: the core fills `id`, `version`,
/// `source`, `group`, and `timestamp`; nothing downstream may mutate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: Uuid,
    pub version: u8,
    pub source: String,
    pub group: Group,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub correlation: Uuid,
    pub arguments: serde_json::Value,
}

impl RequestEnvelope {
    /// Fill identity from session context per router pipeline stage 4.
    pub fn from_session(
        topic: String,
        correlation: Uuid,
        arguments: serde_json::Value,
        session_id: &str,
        group: Group,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            source: session_id.to_string(),
            group,
            timestamp: Utc::now(),
            topic,
            correlation,
            arguments,
        }
    }
}

/// Carries exactly one of `result` or `error`. Fields are private so the
/// only way to build one is through `ok`/`err`, which makes "exactly one
/// non-null" a compile-time invariant rather than a runtime check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    result: Option<serde_json::Value>,
    error: Option<ErrorPayload>,
}

impl ResponsePayload {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: ErrorPayload) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorPayload> {
        self.error.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Sent back over the same socket the request arrived on. `correlation`
/// copies the request's correlation id so clients can match by id rather
/// than by arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: Uuid,
    pub version: u8,
    pub source: String,
    pub group: Group,
    pub timestamp: DateTime<Utc>,
    pub correlation: Uuid,
    pub payload: ResponsePayload,
}

impl ResponseEnvelope {
    pub fn from_request(request: &RequestEnvelope, payload: ResponsePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            source: "core".to_string(),
            group: request.group.clone(),
            timestamp: Utc::now(),
            correlation: request.correlation,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_payload_exactly_one_non_null() {
        let ok = ResponsePayload::ok(serde_json::json!({"a": 1}));
        assert!(ok.result().is_some());
        assert!(ok.error().is_none());

        let err = ResponsePayload::err(ErrorPayload::new(crate::error::ErrorCode::UnknownTool, "nope"));
        assert!(err.result().is_none());
        assert!(err.error().is_some());
    }

    #[test]
    fn response_copies_request_correlation() {
        let req = RequestEnvelope::from_session(
            "tool.invoke.echo".into(),
            Uuid::new_v4(),
            serde_json::json!({}),
            "session-1",
            Group::from("g1"),
        );
        let resp = ResponseEnvelope::from_request(&req, ResponsePayload::ok(serde_json::json!(null)));
        assert_eq!(resp.correlation, req.correlation);
        assert_eq!(resp.version, 1);
        assert_eq!(resp.source, "core");
    }
}
