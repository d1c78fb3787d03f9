//! The `Supervisor` value: the one place every subsystem gets constructed
//! and wired together, replacing the dynamic-import/global-registry design
//! the distilled spec's redesign notes reject. One `Supervisor` is built
//! fresh per process (or per test) from a `Config` and owns everything
//! downstream of it — no subsystem reaches for ambient global state.
//!
//! Grounded on the teacher's `state.rs` (`AppState` as the single
//! dependency-injection root threaded through every handler) and
//! `bootstrap.rs` (directory creation / first-run setup ahead of serving).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use carapace_bus::InProcessBus;
use carapace_domain::config::Config;
use carapace_domain::envelope::{EventEnvelope, Group};
use carapace_domain::session::Session;
use carapace_domain::AuditLog;
use carapace_plugins::catalog::ToolCatalog;
use carapace_plugins::host::{PluginHost, SessionInfoQuery, SessionLookup};
use carapace_protocol::transport::{RequestSocket, UnixRequestSocket};
use carapace_schema::SchemaCache;
use carapace_sessions::dispatcher::{Dispatcher, ExplicitSessionResolver};
use carapace_sessions::manager::SessionManager;
use carapace_sessions::runtime::{probe, ContainerRuntime, ProcessRuntime};
use carapace_sessions::store::ClaudeSessionStore;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cancel::CancelRegistry;
use crate::confirmation::ConfirmationGate;
use crate::intrinsics::{IntrinsicsHandler, PluginHealthRegistry, SessionStartedAt};
use crate::rate_limit::RateLimiter;
use crate::router::{Router, SessionContext};

/// Expands a leading `~` the way the teacher's workspace-path handling does
/// (`sa-gateway::workspace::files`), since `Config::home` is written for
/// human editing and TOML has no notion of the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Adapts `SessionManager` to the narrow views `carapace-plugins` and
/// `carapace-gateway::intrinsics` need, so neither of those crates gains a
/// concrete dependency on `carapace-sessions`.
struct SessionManagerInfo(Arc<SessionManager>);

impl SessionManagerInfo {
    fn latest_start(&self, group: &Group) -> Option<DateTime<Utc>> {
        self.0.list_for_group(group).into_iter().map(|s| s.started_at).max()
    }
}

impl SessionInfoQuery for SessionManagerInfo {
    fn session_started_at(&self, group: &Group) -> Option<DateTime<Utc>> {
        self.latest_start(group)
    }
}

impl SessionStartedAt for SessionManagerInfo {
    fn started_at(&self, group: &Group) -> Option<DateTime<Utc>> {
        self.latest_start(group)
    }
}

/// Adapts `SessionManager` to the router's `SessionContext` view: identity
/// lookup and liveness, nothing about spawning or streaming.
struct SessionManagerContext(Arc<SessionManager>);

impl SessionContext for SessionManagerContext {
    fn lookup(&self, identity: &str) -> Option<Session> {
        self.0.get(identity)
    }

    fn is_alive(&self, session_id: &str) -> bool {
        self.0.get(session_id).is_some()
    }
}

/// Adapts the concrete `UnixRequestSocket` to the narrow
/// `SessionSocketBinder` view `carapace-sessions` expects, so that crate
/// never gains a concrete dependency on `carapace-protocol`'s transport.
struct UnixSocketBinder(Arc<UnixRequestSocket>);

#[async_trait]
impl carapace_sessions::SessionSocketBinder for UnixSocketBinder {
    async fn bind_session(&self, session_id: &str) -> std::io::Result<PathBuf> {
        self.0.register_session(session_id).await?;
        Ok(self.0.session_socket_path(session_id))
    }

    fn unbind_session(&self, session_id: &str) {
        self.0.unregister_session(session_id);
    }
}

/// Looks up the most recent Claude session id recorded for a group, for the
/// `explicit` session policy's plugin-driven resolution.
struct ClaudeSessionLookup(Arc<ClaudeSessionStore>);

impl SessionLookup for ClaudeSessionLookup {
    fn lookup(&self, group: &Group) -> Option<Uuid> {
        self.0.get_latest(group)
    }
}

/// Resolves `explicit`-policy groups by asking whichever plugin registered
/// itself as the explicit-session handler, per `PluginHost::explicit_session_handler`.
/// Absent such a plugin, resolution always misses and the dispatcher falls
/// back to a fresh session (per the session-manager's own default).
struct PluginExplicitResolver {
    plugin_host: Arc<PluginHost>,
    claude_sessions: Arc<ClaudeSessionStore>,
}

#[async_trait]
impl ExplicitSessionResolver for PluginExplicitResolver {
    async fn resolve_session(&self, _group: &Group, envelope: &EventEnvelope) -> Option<Uuid> {
        let handler = self.plugin_host.explicit_session_handler()?;
        let lookup = ClaudeSessionLookup(self.claude_sessions.clone());
        handler.resolve_session(envelope, &lookup).await
    }
}

/// Everything a running supervisor owns. Constructed once by `bootstrap`;
/// `shutdown` tears it back down in the reverse order.
pub struct Supervisor {
    pub config: Arc<Config>,
    pub audit: Arc<AuditLog>,
    pub catalog: Arc<ToolCatalog>,
    pub bus: Arc<InProcessBus>,
    pub sessions: Arc<SessionManager>,
    pub plugin_host: Arc<PluginHost>,
    pub health: Arc<PluginHealthRegistry>,
    router: Arc<Router>,
    router_task: JoinHandle<()>,
    dispatch_tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Build every subsystem in dependency order (per `SPEC_FULL.md` §2)
    /// and start the acceptor + dispatch loops. Returns before the request
    /// socket has accepted a single connection — `spec.md`'s `start`
    /// subcommand is expected to block separately on a shutdown signal.
    pub async fn bootstrap(config: Config) -> anyhow::Result<Arc<Supervisor>> {
        let config = Arc::new(config);
        let home = expand_home(&config.home);
        std::fs::create_dir_all(&home)?;

        let audit = Arc::new(AuditLog::new(4096).with_logs_root(home.join("logs")));
        let catalog = Arc::new(ToolCatalog::new());
        let schema_cache = Arc::new(SchemaCache::new());
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.requests_per_minute,
            config.rate_limit.burst_size,
        ));
        let confirmation = Arc::new(ConfirmationGate::new());
        let cancel = Arc::new(CancelRegistry::new());
        let bus = InProcessBus::new(1024);

        let claude_session_ttl = chrono::Duration::from_std(config.sessions.claude_session_ttl)?;
        let claude_sessions = Arc::new(ClaudeSessionStore::load(&home, claude_session_ttl)?);

        let runtime = probe_runtime(&config.containers.runtimes).await?;

        // One dedicated Unix listener per session, not a single shared
        // socket — see `UnixRequestSocket`'s doc comment for why that's the
        // only way the session-id-as-connection-identity invariant holds.
        let request_socket = UnixRequestSocket::new(home.join("sockets"))?;
        let sessions = Arc::new(
            SessionManager::new(
                runtime,
                config.containers.image_tag.clone(),
                bus.clone(),
                claude_sessions.clone(),
                config.sessions.max_sessions_per_group,
                config.sessions.stop_timeout,
            )
            .with_socket_binder(
                Arc::new(UnixSocketBinder(request_socket.clone())),
                PathBuf::from("/run/carapace.sock"),
            ),
        );

        let plugin_host = Arc::new(PluginHost::new(
            catalog.clone(),
            config.plugin_host.init_timeout,
            config.plugin_host.shutdown_timeout,
        ));
        let health = Arc::new(PluginHealthRegistry::new());

        let session_info = Arc::new(SessionManagerInfo(sessions.clone()));
        let intrinsics = Arc::new(IntrinsicsHandler::new(
            catalog.clone(),
            audit.clone(),
            health.clone(),
            session_info,
        ));
        intrinsics.register_all(&catalog)?;

        let explicit_resolver = Arc::new(PluginExplicitResolver {
            plugin_host: plugin_host.clone(),
            claude_sessions: claude_sessions.clone(),
        });
        // `SessionSpawner` is implemented for `Arc<SessionManager>` (not
        // `SessionManager` itself, since `spawn` needs `self: &Arc<Self>` to
        // clone itself into its own lifecycle-poll task), so the trait
        // object is built from an `Arc` wrapping that `Arc`.
        let spawner: Arc<dyn carapace_sessions::dispatcher::SessionSpawner> = Arc::new(sessions.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(config.dispatcher.clone()),
            config.sessions.max_sessions_per_group,
            spawner,
            claude_sessions.clone(),
            explicit_resolver,
        ));

        let socket: Arc<dyn RequestSocket> = request_socket;
        let worker_count = 4 * num_cpus::get();
        let router = Router::new(
            socket,
            catalog.clone(),
            schema_cache,
            rate_limiter,
            confirmation,
            audit.clone(),
            cancel,
            Arc::new(SessionManagerContext(sessions.clone())),
            config.router.clone(),
            worker_count,
        );
        let router_task = router.clone().spawn();

        let dispatch_tasks = vec![
            spawn_dispatch_loop(bus.clone(), dispatcher.clone(), "message.inbound"),
            spawn_dispatch_loop(bus.clone(), dispatcher, "task.triggered"),
        ];

        tracing::info!(home = %home.display(), sockets = %home.join("sockets").display(), "supervisor started");

        Ok(Arc::new(Supervisor {
            config,
            audit,
            catalog,
            bus,
            sessions,
            plugin_host,
            health,
            router,
            router_task,
            dispatch_tasks,
        }))
    }

    /// Abort the acceptor and dispatch loops and tear down every live
    /// session's container. Idempotent: aborting an already-finished task
    /// is a no-op.
    pub async fn shutdown(&self) {
        tracing::info!("supervisor shutting down");
        self.router_task.abort();
        for task in &self.dispatch_tasks {
            task.abort();
        }
        self.plugin_host.shutdown_all().await;
        for session in self.sessions.list_all() {
            let _ = self.sessions.stop(&session.session_id).await;
        }
    }
}

async fn probe_runtime(names: &[String]) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    let candidates: Vec<Arc<dyn ContainerRuntime>> = names
        .iter()
        .map(|name| -> Arc<dyn ContainerRuntime> {
            match name.as_str() {
                "podman" => Arc::new(ProcessRuntime::podman()),
                "apple" => Arc::new(ProcessRuntime::apple()),
                _ => Arc::new(ProcessRuntime::docker()),
            }
        })
        .collect();

    probe(&candidates)
        .await
        .ok_or_else(|| anyhow::anyhow!("no configured container runtime is available: {:?}", names))
}

/// One task per event topic this supervisor acts on, per `SPEC_FULL.md` §5
/// ("one task per event-bus subscription"). Each subscription only ever
/// sees the exact topic it names since `InProcessBus` matches by prefix and
/// these two topics share no common prefix.
fn spawn_dispatch_loop(bus: Arc<InProcessBus>, dispatcher: Arc<Dispatcher>, topic: &'static str) -> JoinHandle<()> {
    let subscription = bus.subscribe(topic);
    tokio::spawn(async move {
        loop {
            let envelope = subscription.recv().await;
            let result = dispatcher.dispatch(envelope).await;
            tracing::debug!(topic, ?result, "dispatch result");
        }
    })
}
