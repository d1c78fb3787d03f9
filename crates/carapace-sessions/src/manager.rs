//! `SessionManager`: owns the live session table and the container
//! lifecycle. Per `SPEC_FULL.md` §5, "the session map is guarded by a single
//! exclusive lock for structural changes (insert/remove); reads of an
//! individual session's state go through that session's own handle" —
//! grounded on the teacher's `sa-sessions::manager` pattern of a coarse
//! `RwLock` over the table plus fine-grained per-entry state, and on
//! `other_examples/jcttech-claude-session-manager/container.rs`'s
//! supervisory per-session task spawning (reader tasks plus a lifecycle
//! poll loop).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carapace_bus::InProcessBus;
use carapace_domain::envelope::Group;
use carapace_domain::session::{Session, SessionPolicy};
use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::runtime::{ContainerRuntime, ContainerStatus, RunHandle, RuntimeError, SocketMount, SpawnOptions};
use crate::store::ClaudeSessionStore;
use crate::stream::{drain_stderr, drive_stdout, StreamParser};

/// Binds a freshly-assigned session id to its own request-socket listener
/// ahead of container start, and hands back the host-side socket path to
/// mount into that container. A narrow interface rather than a concrete
/// dependency on `carapace-protocol`'s `UnixRequestSocket` — the supervisor
/// wires the real implementation in, per the "session manager is injected
/// as an interface" redesign note applied symmetrically to the socket side.
#[async_trait]
pub trait SessionSocketBinder: Send + Sync {
    async fn bind_session(&self, session_id: &str) -> std::io::Result<PathBuf>;
    fn unbind_session(&self, session_id: &str);
}

/// No-op binder for tests and for runtimes (like [`crate::runtime::FakeRuntime`])
/// that never actually read a mounted socket path.
pub struct NullSocketBinder;

#[async_trait]
impl SessionSocketBinder for NullSocketBinder {
    async fn bind_session(&self, session_id: &str) -> std::io::Result<PathBuf> {
        Ok(PathBuf::from(format!("/tmp/carapace-null-{session_id}.sock")))
    }
    fn unbind_session(&self, _session_id: &str) {}
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("group '{0}' has reached its concurrent session limit")]
    ConcurrencyLimitReached(String),
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Internal bookkeeping for a live session; the caller-visible `Session`
/// record plus the handles needed to stop it and observe its lifecycle.
struct SessionEntry {
    session: Session,
    cancel: CancellationToken,
    parser: Arc<StreamParser>,
    stop_tx: Option<oneshot::Sender<()>>,
}

/// Spawn request: what the dispatcher decided to run, after session-policy
/// resolution (fresh/resume/explicit) has already happened.
pub struct SpawnRequest {
    pub group: Group,
    pub connection_identity: String,
    /// `CARAPACE_TASK_PROMPT`, set only for `task.triggered` spawns and only
    /// when `payload.prompt` was present — never for `message.inbound`,
    /// per `SPEC_FULL.md` §4.5 rule 5.
    pub task_prompt: Option<String>,
    pub resume_claude_session_id: Option<Uuid>,
}

pub struct SessionManager {
    runtime: Arc<dyn ContainerRuntime>,
    image_tag: String,
    bus: Arc<InProcessBus>,
    claude_sessions: Arc<ClaudeSessionStore>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    max_sessions_per_group: usize,
    stop_timeout: Duration,
    poll_interval: Duration,
    /// Binds each new session id to its own dedicated request-socket
    /// listener (per `SPEC_FULL.md` §3: "the sessionId is also the socket
    /// identity used for dealer routing") and hands back the host path to
    /// mount; see [`SessionSocketBinder`].
    socket_binder: Arc<dyn SessionSocketBinder>,
    /// The fixed path the container is told to find its socket at, the same
    /// for every container since each gets its own distinct host-side mount
    /// target at that in-container path.
    container_socket_path: PathBuf,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        image_tag: String,
        bus: Arc<InProcessBus>,
        claude_sessions: Arc<ClaudeSessionStore>,
        max_sessions_per_group: usize,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            image_tag,
            bus,
            claude_sessions,
            sessions: RwLock::new(HashMap::new()),
            max_sessions_per_group,
            stop_timeout,
            poll_interval: Duration::from_secs(2),
            socket_binder: Arc::new(NullSocketBinder),
            container_socket_path: PathBuf::from("/run/carapace.sock"),
        }
    }

    /// Attach the real per-session socket binder and the in-container mount
    /// target. Separate from `new` so tests and the `FakeRuntime` harness can
    /// construct a manager without caring about socket paths at all.
    pub fn with_socket_binder(mut self, binder: Arc<dyn SessionSocketBinder>, container_socket_path: PathBuf) -> Self {
        self.socket_binder = binder;
        self.container_socket_path = container_socket_path;
        self
    }

    /// Count of live sessions for `group`. Used by the dispatcher's
    /// concurrency-limit rule, evaluated before the exclusive insert lock is
    /// taken so the common case (under the limit) stays fast.
    pub fn active_count(&self, group: &Group) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|entry| &entry.session.group == group)
            .count()
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).map(|e| e.session.clone())
    }

    pub fn list_for_group(&self, group: &Group) -> Vec<Session> {
        self.sessions
            .read()
            .values()
            .filter(|e| &e.session.group == group)
            .map(|e| e.session.clone())
            .collect()
    }

    /// Every live session, regardless of group. Used by shutdown, which
    /// must tear down every container the supervisor owns rather than one
    /// group's worth.
    pub fn list_all(&self) -> Vec<Session> {
        self.sessions.read().values().map(|e| e.session.clone()).collect()
    }

    /// Spawn a new container for `req`, enforcing the per-group concurrency
    /// limit before taking the structural write lock.
    pub async fn spawn(self: &Arc<Self>, req: SpawnRequest) -> Result<Session, SessionError> {
        if self.active_count(&req.group) >= self.max_sessions_per_group {
            return Err(SessionError::ConcurrencyLimitReached(req.group.as_str().to_string()));
        }

        let session_id = Uuid::new_v4().to_string();

        // Bind this session's dedicated request-socket listener before the
        // container starts, so the mount target exists by the time it tries
        // to connect. The container is told the fixed in-container path; the
        // host-side path is unique per session and never shared.
        let host_socket_path = self
            .socket_binder
            .bind_session(&session_id)
            .await
            .map_err(|e| SessionError::Runtime(RuntimeError::Io(e)))?;

        let mut env = HashMap::new();
        if let Some(task_prompt) = &req.task_prompt {
            env.insert("CARAPACE_TASK_PROMPT".to_string(), task_prompt.clone());
        }
        env.insert(
            "CARAPACE_SOCKET_PATH".to_string(),
            self.container_socket_path.to_string_lossy().into_owned(),
        );
        if let Some(resume_id) = req.resume_claude_session_id {
            env.insert("CARAPACE_RESUME_SESSION_ID".to_string(), resume_id.to_string());
        }

        let run_result = self
            .runtime
            .run(SpawnOptions {
                image_tag: self.image_tag.clone(),
                env,
                socket_mounts: vec![SocketMount {
                    host_path: host_socket_path,
                    container_path: self.container_socket_path.clone(),
                }],
                ..Default::default()
            })
            .await;
        let handle: RunHandle = match run_result {
            Ok(h) => h,
            Err(e) => {
                self.socket_binder.unbind_session(&session_id);
                return Err(e.into());
            }
        };

        let session = Session {
            session_id: session_id.clone(),
            group: req.group.clone(),
            container_id: handle.id.clone(),
            connection_identity: req.connection_identity.clone(),
            started_at: Utc::now(),
        };

        let parser = Arc::new(StreamParser::new(req.group.clone(), session_id.clone()));
        let cancel = CancellationToken::new();
        let (stop_tx, stop_rx) = oneshot::channel();

        if let Some(stdout) = handle.stdout {
            let parser = parser.clone();
            let bus = self.bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = drive_stdout(stdout, parser, bus) => {}
                    _ = cancel.cancelled() => {}
                }
            });
        }
        if let Some(stderr) = handle.stderr {
            let sid = session_id.clone();
            tokio::spawn(async move {
                drain_stderr(stderr, sid).await;
            });
        }

        self.spawn_lifecycle_poll(handle.id.clone(), session_id.clone(), stop_rx);

        self.sessions.write().insert(
            session_id.clone(),
            SessionEntry {
                session: session.clone(),
                cancel,
                parser,
                stop_tx: Some(stop_tx),
            },
        );

        tracing::info!(session_id = %session_id, group = %session.group, container_id = %session.container_id, "session spawned");
        Ok(session)
    }

    /// Poll `inspect` on an interval until the container exits or a stop is
    /// requested, then clean up the session table. `ContainerRuntime` has no
    /// "wait for exit" primitive, so this supervisory task is the only way
    /// to observe a container dying on its own.
    fn spawn_lifecycle_poll(self: &Arc<Self>, container_id: String, session_id: String, mut stop_rx: oneshot::Receiver<()>) {
        let manager = self.clone();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match manager.runtime.inspect(&container_id).await {
                            Ok(ContainerStatus::Running) => continue,
                            Ok(_) => {
                                tracing::info!(%session_id, "container exited, cleaning up session");
                                manager.finish(&session_id).await;
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(%session_id, error = %e, "inspect failed during lifecycle poll");
                                continue;
                            }
                        }
                    }
                    _ = &mut stop_rx => {
                        manager.finish(&session_id).await;
                        break;
                    }
                }
            }
        });
    }

    /// Request graceful shutdown of a running session: cancel the reader
    /// task, stop the container, persist the observed Claude session id,
    /// and remove it from the table.
    pub async fn stop(&self, session_id: &str) -> Result<(), SessionError> {
        let container_id = {
            let sessions = self.sessions.read();
            let entry = sessions.get(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            entry.session.container_id.clone()
        };
        self.runtime.stop(&container_id, self.stop_timeout).await?;
        self.finish(session_id).await;
        Ok(())
    }

    /// Best-effort immediate kill, used when `stop`'s graceful timeout
    /// elapses. Per `SPEC_FULL.md` §4.4, stop escalates to kill rather than
    /// leaving a session wedged.
    pub async fn kill(&self, session_id: &str) -> Result<(), SessionError> {
        let container_id = {
            let sessions = self.sessions.read();
            let entry = sessions.get(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            entry.session.container_id.clone()
        };
        self.runtime.kill(&container_id).await?;
        self.finish(session_id).await;
        Ok(())
    }

    async fn finish(&self, session_id: &str) {
        let entry = self.sessions.write().remove(session_id);
        let Some(entry) = entry else { return };
        entry.cancel.cancel();
        if let Some(claude_id) = entry.parser.claude_session_id() {
            self.claude_sessions.save(&entry.session.group, claude_id);
        }
        let _ = self.runtime.remove(&entry.session.container_id).await;
        self.socket_binder.unbind_session(session_id);
        tracing::info!(%session_id, "session finished and removed");
    }

    /// Cooperative cancellation for an in-flight session, independent of
    /// container teardown: signals the reader task to stop consuming
    /// output without killing the container itself.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.sessions.read().get(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Resolves a group's configured session policy into a concrete resume
/// target, consulting the Claude session store for `resume` groups.
pub fn resume_target(policy: SessionPolicy, group: &Group, store: &ClaudeSessionStore) -> Option<Uuid> {
    match policy {
        SessionPolicy::Fresh => None,
        SessionPolicy::Resume => store.get_latest(group),
        SessionPolicy::Explicit => None,
    }
}

#[async_trait::async_trait]
impl crate::dispatcher::SessionSpawner for Arc<SessionManager> {
    async fn active_count(&self, group: &Group) -> usize {
        SessionManager::active_count(self, group)
    }

    async fn spawn(&self, req: SpawnRequest) -> Result<Session, SessionError> {
        SessionManager::spawn(self, req).await
    }
}
