//! NDJSON stdout classification. A spawned agent container writes one JSON
//! object per line to stdout (the `claude -p --output-format stream-json`
//! convention); this module turns each line into a `response.*` event with
//! a strictly-increasing per-session `seq`, per `SPEC_FULL.md` §4.6.
//!
//! Grounded on `other_examples/jcttech-claude-session-manager/container.rs`'s
//! `message_processor`/`StreamLine` (reads raw JSON lines from a child's
//! stdout and classifies them into typed output events), generalized from
//! its devcontainer-specific message shapes to Carapace's `response.*` topic
//! family and the `system`/`assistant`/`tool_result`/`result` line types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use carapace_bus::InProcessBus;
use carapace_domain::envelope::{EventEnvelope, Group};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use uuid::Uuid;

/// One line of the `claude -p --output-format stream-json` protocol, as
/// emitted on a container's stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    System {
        #[serde(default)]
        session_id: Option<Uuid>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    ToolResult {
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        duration_ms: u64,
    },
    Result {
        #[serde(default)]
        session_id: Option<Uuid>,
        #[serde(default)]
        exit_code: i32,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: Value },
    #[serde(other)]
    Other,
}

/// A classified output line, ready to be published on the bus under
/// `topic`. `seq` is strictly increasing within a session's lifetime.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OutputEvent {
    pub seq: u64,
    pub topic: String,
    pub payload: Value,
}

/// Tracks the Claude-assigned session id observed in `system`/`result`
/// frames, and hands out a monotonic `seq` per line classified.
pub struct StreamParser {
    group: Group,
    session_id: String,
    next_seq: AtomicU64,
    claude_session_id: parking_lot::Mutex<Option<Uuid>>,
}

impl StreamParser {
    pub fn new(group: Group, session_id: String) -> Self {
        Self {
            group,
            session_id,
            next_seq: AtomicU64::new(0),
            claude_session_id: parking_lot::Mutex::new(None),
        }
    }

    pub fn claude_session_id(&self) -> Option<Uuid> {
        *self.claude_session_id.lock()
    }

    /// Parse and classify one NDJSON line. Blank lines are skipped silently;
    /// malformed JSON is reported as `response.error{reason:"malformed"}`
    /// rather than dropped, so a container emitting garbage is still
    /// observable and the reader never crashes.
    pub fn classify_line(&self, raw: &str) -> Option<OutputEvent> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let parsed: Result<StreamLine, _> = serde_json::from_str(trimmed);
        let (topic, payload) = match parsed {
            Ok(StreamLine::System { session_id, model }) => {
                if let Some(id) = session_id {
                    *self.claude_session_id.lock() = Some(id);
                }
                (
                    "response.system",
                    serde_json::json!({ "claudeSessionId": session_id, "model": model }),
                )
            }
            Ok(StreamLine::Assistant { message }) => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                for block in message.content {
                    match block {
                        ContentBlock::Text { text: t } => text.push_str(&t),
                        ContentBlock::ToolUse { name, input } => {
                            tool_calls.push(serde_json::json!({ "toolName": name, "toolInput": input }));
                        }
                        ContentBlock::Other => {}
                    }
                }
                if let Some(first) = tool_calls.into_iter().next() {
                    ("response.tool_call", first)
                } else {
                    ("response.chunk", serde_json::json!({ "text": text }))
                }
            }
            // Metadata only: the result content itself never republishes here.
            Ok(StreamLine::ToolResult { tool_name, success, duration_ms }) => (
                "response.tool_result",
                serde_json::json!({ "toolName": tool_name, "success": success, "durationMs": duration_ms }),
            ),
            Ok(StreamLine::Result { session_id, exit_code }) => {
                if let Some(id) = session_id {
                    *self.claude_session_id.lock() = Some(id);
                }
                (
                    "response.end",
                    serde_json::json!({ "claudeSessionId": session_id, "exitCode": exit_code }),
                )
            }
            Ok(StreamLine::Unknown) => ("response.error", serde_json::json!({ "reason": "unknown_line_type", "raw": trimmed })),
            Err(_) => ("response.error", serde_json::json!({ "reason": "malformed", "raw": trimmed })),
        };

        Some(OutputEvent {
            seq,
            topic: topic.to_string(),
            payload,
        })
    }
}

/// Drains a container's stdout line by line, classifying and publishing
/// each line on `bus` until EOF. Runs as its own task per session, mirroring
/// `message_processor`'s dedicated read loop.
pub async fn drive_stdout(
    stdout: Box<dyn AsyncRead + Unpin + Send>,
    parser: Arc<StreamParser>,
    bus: Arc<InProcessBus>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = parser.classify_line(&line) {
                    let mut payload = event.payload;
                    if let Value::Object(ref mut map) = payload {
                        map.insert("seq".into(), serde_json::json!(event.seq));
                    }
                    let envelope = EventEnvelope::new_event(
                        event.topic.clone(),
                        "carapace-sessions".to_string(),
                        parser.group.clone(),
                        payload,
                    );
                    bus.publish(envelope).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, session_id = %parser.session_id, "stdout read error");
                break;
            }
        }
    }
}

/// Drains a container's stderr, logging each line. Containers are not
/// expected to write diagnostics to stderr in normal operation, so any
/// output here is logged at `warn`.
pub async fn drain_stderr(stderr: Box<dyn AsyncRead + Unpin + Send>, session_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(%session_id, stderr = %line, "container stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> StreamParser {
        StreamParser::new(Group::from("email"), "sess-1".into())
    }

    #[test]
    fn classifies_system_and_captures_session_id() {
        let p = parser();
        let id = Uuid::new_v4();
        let line = format!(r#"{{"type":"system","session_id":"{id}","model":"claude"}}"#);
        let event = p.classify_line(&line).unwrap();
        assert_eq!(event.topic, "response.system");
        assert_eq!(p.claude_session_id(), Some(id));
    }

    #[test]
    fn classifies_assistant_text_as_chunk() {
        let p = parser();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        let event = p.classify_line(line).unwrap();
        assert_eq!(event.topic, "response.chunk");
        assert_eq!(event.payload["text"], "hi");
    }

    #[test]
    fn classifies_tool_use_as_tool_call() {
        let p = parser();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"list_tools","input":{}}]}}"#;
        let event = p.classify_line(line).unwrap();
        assert_eq!(event.topic, "response.tool_call");
        assert_eq!(event.payload["toolName"], "list_tools");
    }

    #[test]
    fn tool_result_carries_metadata_only() {
        let p = parser();
        let line = r#"{"type":"tool_result","tool_name":"list_tools","success":true,"duration_ms":12}"#;
        let event = p.classify_line(line).unwrap();
        assert_eq!(event.topic, "response.tool_result");
        assert_eq!(event.payload["toolName"], "list_tools");
        assert_eq!(event.payload["success"], true);
        assert_eq!(event.payload["durationMs"], 12);
        assert!(event.payload.get("result").is_none());
    }

    #[test]
    fn classifies_result_as_end() {
        let p = parser();
        let id = Uuid::new_v4();
        let line = format!(r#"{{"type":"result","session_id":"{id}","exit_code":0}}"#);
        let event = p.classify_line(&line).unwrap();
        assert_eq!(event.topic, "response.end");
        assert_eq!(p.claude_session_id(), Some(id));
    }

    #[test]
    fn malformed_line_becomes_response_error_with_reason() {
        let p = parser();
        let event = p.classify_line("not json").unwrap();
        assert_eq!(event.topic, "response.error");
        assert_eq!(event.payload["reason"], "malformed");
    }

    #[test]
    fn blank_line_is_ignored() {
        let p = parser();
        assert!(p.classify_line("   ").is_none());
    }

    #[test]
    fn seq_strictly_increases() {
        let p = parser();
        let a = p.classify_line(r#"{"type":"tool_result","success":true}"#).unwrap();
        let b = p.classify_line(r#"{"type":"tool_result","success":true}"#).unwrap();
        assert!(b.seq > a.seq);
    }
}
