//! `Dispatcher`: turns `message.inbound`/`task.triggered` events into spawn
//! decisions. Implements the 6 ordered rules verbatim; grounded on the
//! teacher's tool-prefix-match dispatch shape adapted from channel-message
//! routing to session-spawn routing, and on `SPEC_FULL.md` §9's resolved
//! Open Questions (`task.triggered` bypasses rule 2 but not rule 3).
//!
//! Per the design note that the dispatcher must not hold a concrete
//! dependency on the session manager or the plugin host — "the session
//! manager is injected into the dispatcher as an interface, not a concrete
//! type" — this module defines two narrow traits (`SessionSpawner`,
//! `ExplicitSessionResolver`) rather than depending on `carapace-plugins`.

use std::sync::Arc;

use async_trait::async_trait;
use carapace_domain::config::DispatcherConfig;
use carapace_domain::envelope::{EventEnvelope, Group};
use carapace_domain::session::{Session, SessionPolicy};
use carapace_schema::CompiledSchema;
use serde_json::json;
use uuid::Uuid;

use crate::manager::{SessionError, SpawnRequest};
use crate::store::ClaudeSessionStore;

/// `{channel, sender, content_type, body}`, extra fields rejected, per
/// `SPEC_FULL.md` §6.
fn message_inbound_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "channel": {"type": "string"},
            "sender": {"type": "string"},
            "content_type": {"type": "string"},
            "body": {"type": "string"},
        },
        "required": ["channel", "sender", "content_type", "body"],
        "additionalProperties": false,
    })
}

/// `{prompt?: string}`, extra fields tolerated, per `SPEC_FULL.md` §6.
fn task_triggered_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "prompt": {"type": "string"},
        },
        "additionalProperties": true,
    })
}

/// What the session manager exposes to the dispatcher: enough to enforce
/// the concurrency rule and issue a spawn, nothing about containers or
/// streaming.
#[async_trait]
pub trait SessionSpawner: Send + Sync {
    async fn active_count(&self, group: &Group) -> usize;
    async fn spawn(&self, req: SpawnRequest) -> Result<Session, SessionError>;
}

/// Resolves `session:"explicit"` groups to a prior Claude session id by
/// asking the owning plugin. A narrow interface rather than a dependency on
/// `carapace-plugins`'s `PluginHandler` trait — the concrete plugin-backed
/// implementation is wired up by the supervisor, not by this crate.
#[async_trait]
pub trait ExplicitSessionResolver: Send + Sync {
    async fn resolve_session(&self, group: &Group, envelope: &EventEnvelope) -> Option<Uuid>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Spawned { session_id: String },
    Dropped { reason: String },
    Rejected { reason: String },
    Error { reason: String },
}

pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    max_sessions_per_group: usize,
    spawner: Arc<dyn SessionSpawner>,
    claude_sessions: Arc<ClaudeSessionStore>,
    explicit_resolver: Arc<dyn ExplicitSessionResolver>,
    message_inbound_schema: CompiledSchema,
    task_triggered_schema: CompiledSchema,
}

impl Dispatcher {
    pub fn new(
        config: Arc<DispatcherConfig>,
        max_sessions_per_group: usize,
        spawner: Arc<dyn SessionSpawner>,
        claude_sessions: Arc<ClaudeSessionStore>,
        explicit_resolver: Arc<dyn ExplicitSessionResolver>,
    ) -> Self {
        Self {
            config,
            max_sessions_per_group,
            spawner,
            claude_sessions,
            explicit_resolver,
            // Fixed, known-valid schemas compiled once at construction
            // rather than through `SchemaCache`'s per-tool cache, which
            // exists for the router's dynamically-registered tool schemas.
            message_inbound_schema: CompiledSchema::compile(&message_inbound_schema()).expect("message.inbound schema is valid"),
            task_triggered_schema: CompiledSchema::compile(&task_triggered_schema()).expect("task.triggered schema is valid"),
        }
    }

    pub async fn dispatch(&self, envelope: EventEnvelope) -> DispatchResult {
        if envelope.topic != "message.inbound" && envelope.topic != "task.triggered" {
            return DispatchResult::Dropped {
                reason: "no spawn for topic".into(),
            };
        }

        let is_task_triggered = envelope.topic == "task.triggered";

        // §6 payload schema validation, ahead of the six spawn rules: a
        // malformed event never reaches group/concurrency/policy decisions.
        let schema = if is_task_triggered { &self.task_triggered_schema } else { &self.message_inbound_schema };
        if let Err(e) = schema.validate(&envelope.payload) {
            return DispatchResult::Error {
                reason: format!("invalid {} payload: {e}", envelope.topic),
            };
        }

        // Rule 1: empty group is always dropped, for either topic.
        if envelope.group.as_str().is_empty() {
            return DispatchResult::Dropped {
                reason: "empty group".into(),
            };
        }

        // Rule 2: unconfigured groups are dropped for message.inbound only;
        // task.triggered bypasses this check (schedulers may target any group).
        if !is_task_triggered && !self.config.configured_groups.contains(envelope.group.as_str()) {
            return DispatchResult::Dropped {
                reason: "unconfigured group".into(),
            };
        }

        // Rule 3: concurrency limit applies regardless of topic.
        if self.spawner.active_count(&envelope.group).await >= self.max_sessions_per_group {
            return DispatchResult::Rejected {
                reason: "concurrent limit".into(),
            };
        }

        // Rule 4: session policy.
        let policy = self.config.policy_for(envelope.group.as_str());
        let resume_id = match policy {
            SessionPolicy::Fresh => None,
            SessionPolicy::Resume => self.claude_sessions.get_latest(&envelope.group),
            SessionPolicy::Explicit => self.explicit_resolver.resolve_session(&envelope.group, &envelope).await,
        };

        // Rule 5: task.triggered additionally carries CARAPACE_TASK_PROMPT
        // through from payload.prompt, when present. message.inbound has no
        // env-var counterpart — its body reaches the agent by other means,
        // not through core-controlled environment (per spec.md §6's "nothing
        // else is core-controlled").
        let task_prompt = if is_task_triggered {
            envelope.payload.get("prompt").and_then(|v| v.as_str()).map(str::to_string)
        } else {
            None
        };

        // Rule 6: spawn; errors surface rather than retry silently.
        let req = SpawnRequest {
            group: envelope.group.clone(),
            connection_identity: envelope.source.clone(),
            task_prompt,
            resume_claude_session_id: resume_id,
        };
        match self.spawner.spawn(req).await {
            Ok(session) => DispatchResult::Spawned {
                session_id: session.session_id,
            },
            Err(e) => DispatchResult::Error { reason: e.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carapace_domain::envelope::EventEnvelope;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSpawner {
        active: AtomicUsize,
        fail: bool,
        last_task_prompt: std::sync::Mutex<Option<Option<String>>>,
    }

    impl FakeSpawner {
        fn new(active: usize, fail: bool) -> Self {
            Self {
                active: AtomicUsize::new(active),
                fail,
                last_task_prompt: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SessionSpawner for FakeSpawner {
        async fn active_count(&self, _group: &Group) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        async fn spawn(&self, req: SpawnRequest) -> Result<Session, SessionError> {
            *self.last_task_prompt.lock().unwrap() = Some(req.task_prompt.clone());
            if self.fail {
                return Err(SessionError::ConcurrencyLimitReached(req.group.as_str().to_string()));
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                session_id: "sess-1".into(),
                group: req.group,
                container_id: "container-1".into(),
                connection_identity: req.connection_identity,
                started_at: chrono::Utc::now(),
            })
        }
    }

    struct NeverResolves;

    #[async_trait]
    impl ExplicitSessionResolver for NeverResolves {
        async fn resolve_session(&self, _group: &Group, _envelope: &EventEnvelope) -> Option<Uuid> {
            None
        }
    }

    fn dispatcher_with(configured_groups: &[&str], spawner: Arc<FakeSpawner>) -> Dispatcher {
        let config = Arc::new(DispatcherConfig {
            configured_groups: configured_groups.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            group_policies: HashMap::new(),
        });
        Dispatcher::new(
            config,
            2,
            spawner,
            Arc::new(ClaudeSessionStore::new(chrono::Duration::seconds(3600))),
            Arc::new(NeverResolves),
        )
    }

    fn inbound(group: &str, body: &str) -> EventEnvelope {
        EventEnvelope::new_event(
            "message.inbound",
            "email-plugin",
            Group::from(group),
            serde_json::json!({ "channel": "email", "sender": "u@x", "content_type": "text", "body": body }),
        )
    }

    fn task(group: &str, prompt: &str) -> EventEnvelope {
        EventEnvelope::new_event("task.triggered", "scheduler", Group::from(group), serde_json::json!({ "prompt": prompt }))
    }

    #[tokio::test]
    async fn empty_group_is_dropped() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(0, false)));
        let result = d.dispatch(inbound("", "hi")).await;
        assert_eq!(result, DispatchResult::Dropped { reason: "empty group".into() });
    }

    #[tokio::test]
    async fn unconfigured_group_drops_message_inbound() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(0, false)));
        let result = d.dispatch(inbound("slack", "hi")).await;
        assert_eq!(result, DispatchResult::Dropped { reason: "unconfigured group".into() });
    }

    #[tokio::test]
    async fn task_triggered_bypasses_unconfigured_group_check() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(0, false)));
        let result = d.dispatch(task("slack", "run it")).await;
        assert_eq!(result, DispatchResult::Spawned { session_id: "sess-1".into() });
    }

    #[tokio::test]
    async fn task_triggered_still_honors_concurrency_limit() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(2, false)));
        let result = d.dispatch(task("slack", "run it")).await;
        assert_eq!(result, DispatchResult::Rejected { reason: "concurrent limit".into() });
    }

    #[tokio::test]
    async fn concurrency_limit_rejects_message_inbound() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(2, false)));
        let result = d.dispatch(inbound("email", "hi")).await;
        assert_eq!(result, DispatchResult::Rejected { reason: "concurrent limit".into() });
    }

    #[tokio::test]
    async fn unrelated_topic_is_dropped() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(0, false)));
        let envelope = EventEnvelope::new_event("response.chunk", "x", Group::from("email"), serde_json::json!({}));
        let result = d.dispatch(envelope).await;
        assert_eq!(result, DispatchResult::Dropped { reason: "no spawn for topic".into() });
    }

    #[tokio::test]
    async fn spawn_error_surfaces_as_error_result() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(0, true)));
        let result = d.dispatch(inbound("email", "hi")).await;
        assert!(matches!(result, DispatchResult::Error { .. }));
    }

    #[tokio::test]
    async fn successful_spawn_returns_session_id() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(0, false)));
        let result = d.dispatch(inbound("email", "hi")).await;
        assert_eq!(result, DispatchResult::Spawned { session_id: "sess-1".into() });
    }

    #[tokio::test]
    async fn message_inbound_missing_body_is_rejected_before_group_checks() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(0, false)));
        let malformed = EventEnvelope::new_event(
            "message.inbound",
            "email-plugin",
            Group::from("email"),
            serde_json::json!({ "channel": "email", "sender": "u@x", "content_type": "text", "text": "hi" }),
        );
        let result = d.dispatch(malformed).await;
        assert!(matches!(result, DispatchResult::Error { .. }));
    }

    #[tokio::test]
    async fn task_triggered_extra_fields_are_tolerated() {
        let d = dispatcher_with(&["email"], Arc::new(FakeSpawner::new(0, false)));
        let envelope = EventEnvelope::new_event(
            "task.triggered",
            "scheduler",
            Group::from("email"),
            serde_json::json!({ "prompt": "run it", "schedule_id": "abc" }),
        );
        let result = d.dispatch(envelope).await;
        assert_eq!(result, DispatchResult::Spawned { session_id: "sess-1".into() });
    }

    #[tokio::test]
    async fn task_triggered_carries_prompt_into_spawn_request() {
        let spawner = Arc::new(FakeSpawner::new(0, false));
        let d = dispatcher_with(&["email"], spawner.clone());
        d.dispatch(task("email", "run it")).await;
        assert_eq!(*spawner.last_task_prompt.lock().unwrap(), Some(Some("run it".to_string())));
    }

    #[tokio::test]
    async fn message_inbound_never_sets_task_prompt() {
        let spawner = Arc::new(FakeSpawner::new(0, false));
        let d = dispatcher_with(&["email"], spawner.clone());
        d.dispatch(inbound("email", "hello there")).await;
        assert_eq!(*spawner.last_task_prompt.lock().unwrap(), Some(None));
    }
}
