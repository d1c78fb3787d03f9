//! `ContainerRuntime`: the abstract contract the supervisor speaks to
//! whichever container engine it finds at startup. Grounded in
//! `other_examples/jcttech-claude-session-manager/container.rs`'s
//! `ContainerManager` (reuse-vs-cold-start, session table, per-session
//! message-processor task), generalized from its devcontainer-over-SSH
//! specifics to a docker/podman-probed trait, and in the teacher's
//! `sa-tools::process`/`ProcessManager` subprocess-spawning idiom for the
//! concrete `docker`/`podman` implementations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime '{0}' is not available on this host")]
    Unavailable(String),
    #[error("runtime command failed: {0}")]
    CommandFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// `{status}` per `SPEC_FULL.md` §4.4's `inspect(id)` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    NotFound,
}

/// One socket mount: a per-session host path bound read/write into the
/// container at a fixed path.
#[derive(Debug, Clone)]
pub struct SocketMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
}

/// `run(opts)` input. `env` always carries `CARAPACE_TASK_PROMPT` and/or
/// `CARAPACE_RESUME_SESSION_ID` when applicable, per `SPEC_FULL.md` §4.4.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub image_tag: String,
    pub env: HashMap<String, String>,
    pub socket_mounts: Vec<SocketMount>,
    pub credentials_mount: Option<PathBuf>,
    /// `ANTHROPIC_API_KEY={value}\n\n` when an API-key credential is
    /// configured; absent otherwise. OAuth credentials are never passed
    /// this way — they go through `credentials_mount`.
    pub stdin_feed: Option<String>,
}

/// What `run` hands back: the runtime-assigned id/name plus, for
/// subprocess-backed runtimes, the child's piped stdout/stderr for the
/// streaming parser and stderr drain to read from.
pub struct RunHandle {
    pub id: String,
    pub name: String,
    pub stdout: Option<Box<dyn AsyncRead + Unpin + Send>>,
    pub stderr: Option<Box<dyn AsyncRead + Unpin + Send>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;
    async fn is_available(&self) -> bool;
    async fn version(&self) -> Result<String, RuntimeError>;
    async fn image_exists(&self, tag: &str) -> Result<bool, RuntimeError>;
    async fn pull(&self, tag: &str) -> Result<(), RuntimeError>;
    async fn build(&self, context_dir: &std::path::Path, tag: &str) -> Result<(), RuntimeError>;
    async fn inspect_labels(&self, id: &str) -> Result<HashMap<String, String>, RuntimeError>;
    async fn run(&self, opts: SpawnOptions) -> Result<RunHandle, RuntimeError>;
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;
}

/// Probes `candidates` in order (e.g. `["docker", "podman", "apple"]`) and
/// returns the first one reporting itself available. Mirrors "the core
/// probes a configured ordered list ... and uses the first available at
/// startup" from `SPEC_FULL.md` §4.4.
pub async fn probe(candidates: &[std::sync::Arc<dyn ContainerRuntime>]) -> Option<std::sync::Arc<dyn ContainerRuntime>> {
    for runtime in candidates {
        if runtime.is_available().await {
            return Some(runtime.clone());
        }
    }
    None
}

/// Shells out to a CLI binary (`docker` or `podman`) via
/// `tokio::process::Command`, following the teacher's
/// `sa-tools::exec`/`ProcessManager` spawn-and-pipe idiom.
pub struct ProcessRuntime {
    binary: String,
}

impl ProcessRuntime {
    pub fn docker() -> Self {
        Self { binary: "docker".into() }
    }

    pub fn podman() -> Self {
        Self { binary: "podman".into() }
    }

    pub fn apple() -> Self {
        Self { binary: "container".into() }
    }

    async fn run_capture(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(RuntimeError::Io)?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed(format!(
                "{} {}: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn version(&self) -> Result<String, RuntimeError> {
        self.run_capture(&["version", "--format", "{{.Server.Version}}"]).await
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, RuntimeError> {
        let output = Command::new(&self.binary)
            .args(["image", "inspect", tag])
            .output()
            .await
            .map_err(RuntimeError::Io)?;
        Ok(output.status.success())
    }

    async fn pull(&self, tag: &str) -> Result<(), RuntimeError> {
        self.run_capture(&["pull", tag]).await.map(|_| ())
    }

    async fn build(&self, context_dir: &std::path::Path, tag: &str) -> Result<(), RuntimeError> {
        let dir = context_dir.to_string_lossy();
        self.run_capture(&["build", "-t", tag, &dir]).await.map(|_| ())
    }

    async fn inspect_labels(&self, id: &str) -> Result<HashMap<String, String>, RuntimeError> {
        let raw = self.run_capture(&["inspect", "--format", "{{json .Config.Labels}}", id]).await?;
        let labels: HashMap<String, String> = serde_json::from_str(&raw).unwrap_or_default();
        Ok(labels)
    }

    async fn run(&self, opts: SpawnOptions) -> Result<RunHandle, RuntimeError> {
        let name = format!("carapace-{}", uuid::Uuid::new_v4());
        let mut cmd = Command::new(&self.binary);
        cmd.args(["run", "--rm", "-i", "--name", &name]);

        for (key, value) in &opts.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        for mount in &opts.socket_mounts {
            cmd.arg("-v").arg(format!(
                "{}:{}",
                mount.host_path.display(),
                mount.container_path.display()
            ));
        }
        if let Some(credentials) = &opts.credentials_mount {
            cmd.arg("-v").arg(format!("{}:/var/run/carapace/credentials:ro", credentials.display()));
        }
        cmd.arg(&opts.image_tag);

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(RuntimeError::Io)?;

        if let Some(feed) = &opts.stdin_feed {
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                let feed = feed.clone();
                tokio::spawn(async move {
                    let _ = stdin.write_all(feed.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let stdout = child.stdout.take().map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>);
        let stderr = child.stderr.take().map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>);

        // The child itself still needs to run to completion somewhere so
        // its resources are reaped; the session manager's supervisory task
        // polls `inspect` rather than holding this `Child` directly, so we
        // detach a reaper here.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(RunHandle {
            id: name.clone(),
            name,
            stdout,
            stderr,
        })
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        self.run_capture(&["stop", "-t", &timeout.as_secs().to_string(), id]).await.map(|_| ())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.run_capture(&["kill", id]).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.run_capture(&["rm", "-f", id]).await.map(|_| ())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.Status}}", id])
            .output()
            .await
            .map_err(RuntimeError::Io)?;
        if !output.status.success() {
            return Ok(ContainerStatus::NotFound);
        }
        let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(match status.as_str() {
            "running" => ContainerStatus::Running,
            _ => ContainerStatus::Exited,
        })
    }
}

/// In-process fake used by tests: no real container is spawned. Scripted
/// stdout can be queued with [`FakeRuntime::with_script`] so tests can drive
/// the streaming parser end-to-end without a container engine.
pub struct FakeRuntime {
    available: bool,
    scripts: parking_lot::Mutex<std::collections::VecDeque<Vec<u8>>>,
    statuses: dashmap::DashMap<String, ContainerStatus>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            available: true,
            scripts: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            statuses: dashmap::DashMap::new(),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Queue a scripted NDJSON stdout payload for the next `run` call.
    pub fn with_script(self, ndjson: impl Into<Vec<u8>>) -> Self {
        self.scripts.lock().push_back(ndjson.into());
        self
    }

    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        self.statuses.insert(id.to_string(), status);
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn version(&self) -> Result<String, RuntimeError> {
        Ok("fake-1.0".into())
    }

    async fn image_exists(&self, _tag: &str) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn pull(&self, _tag: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn build(&self, _context_dir: &std::path::Path, _tag: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn inspect_labels(&self, _id: &str) -> Result<HashMap<String, String>, RuntimeError> {
        Ok(HashMap::new())
    }

    async fn run(&self, _opts: SpawnOptions) -> Result<RunHandle, RuntimeError> {
        let id = format!("fake-{}", uuid::Uuid::new_v4());
        self.statuses.insert(id.clone(), ContainerStatus::Running);
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        Ok(RunHandle {
            id: id.clone(),
            name: id,
            stdout: Some(Box::new(std::io::Cursor::new(script))),
            stderr: Some(Box::new(std::io::Cursor::new(Vec::new()))),
        })
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.statuses.insert(id.to_string(), ContainerStatus::Exited);
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.statuses.insert(id.to_string(), ContainerStatus::Exited);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.statuses.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        Ok(self.statuses.get(id).map(|s| *s).unwrap_or(ContainerStatus::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_runtime_runs_and_inspects() {
        let runtime = FakeRuntime::new();
        let handle = runtime.run(SpawnOptions::default()).await.unwrap();
        assert_eq!(runtime.inspect(&handle.id).await.unwrap(), ContainerStatus::Running);
        runtime.stop(&handle.id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(runtime.inspect(&handle.id).await.unwrap(), ContainerStatus::Exited);
    }

    #[tokio::test]
    async fn probe_returns_first_available() {
        let unavailable: std::sync::Arc<dyn ContainerRuntime> = std::sync::Arc::new(FakeRuntime::unavailable());
        let available: std::sync::Arc<dyn ContainerRuntime> = std::sync::Arc::new(FakeRuntime::new());
        let found = probe(&[unavailable, available]).await;
        assert!(found.is_some());
        assert_eq!(found.unwrap().name(), "fake");
    }

    #[tokio::test]
    async fn probe_returns_none_when_all_unavailable() {
        let a: std::sync::Arc<dyn ContainerRuntime> = std::sync::Arc::new(FakeRuntime::unavailable());
        let b: std::sync::Arc<dyn ContainerRuntime> = std::sync::Arc::new(FakeRuntime::unavailable());
        assert!(probe(&[a, b]).await.is_none());
    }
}
