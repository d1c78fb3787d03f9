//! The CLI surface: `start | stop | status | doctor | uninstall | auth
//! {api-key|login|status}`, exit code 0 on success and 1 on failure, per
//! `SPEC_FULL.md` §6. Only `start` touches the core — it builds a
//! `Supervisor`, writes a PID file, and blocks until a shutdown signal.
//! The rest are "external collaborator, not in core" (`spec.md` §6):
//! thin stubs that hold the exit-code contract without any business logic.
//!
//! Grounded on the teacher's `cli/mod.rs` (`Cli`/`Command` via `clap`
//! derive, a shared `load_config` helper) and `cli/pid.rs` (PID file
//! written with an `fs2` exclusive lock, held for the process lifetime).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fs2::FileExt;

use carapace_domain::config::{Config, ConfigSeverity};

#[derive(Debug, Parser)]
#[command(name = "carapace", version, about = "Local supervisor for sandboxed agent sessions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the supervisor (default when no subcommand is given).
    Start,
    /// Stop a running supervisor, identified by its PID file.
    Stop,
    /// Report whether a supervisor is running.
    Status,
    /// Run non-fatal structural checks against the current configuration.
    /// Out of core scope (`spec.md` §1) — reports config/container-runtime
    /// reachability only, never core business logic.
    Doctor,
    /// Remove the supervisor's persisted state (PID file, home directory).
    /// Out of core scope — does not touch any running process.
    Uninstall,
    /// Credential setup for plugins. Out of core scope — the supervisor
    /// itself never authenticates its operator (`spec.md` §1 Non-goals).
    #[command(subcommand)]
    Auth(AuthCommand),
}

#[derive(Debug, Subcommand)]
pub enum AuthCommand {
    /// Store an API key credential under the configured credentials root.
    ApiKey {
        /// Plugin name the credential belongs to.
        plugin: String,
        /// Credential key (e.g. "api_key").
        key: String,
    },
    /// Run an OAuth device-code login flow for a plugin.
    Login { plugin: String },
    /// Report whether a credential is present, without revealing its value.
    Status { plugin: String, key: String },
}

/// `pass | warn | fail` plus an optional human-readable fix, per
/// `spec.md` §6 ("doctor and CLI surface use a separate check-result
/// shape ... these never map back into wire errors").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
    pub fix: Option<&'static str>,
}

impl CheckResult {
    fn print(&self) {
        let label = match self.status {
            CheckStatus::Pass => "PASS",
            CheckStatus::Warn => "WARN",
            CheckStatus::Fail => "FAIL",
        };
        println!("  [{label}] {}: {}", self.name, self.detail);
        if let Some(fix) = self.fix {
            println!("      fix: {fix}");
        }
    }
}

/// Loads the configuration from `CARAPACE_CONFIG` (or `carapace.toml` in
/// the current directory by default), falling back to built-in defaults
/// when no file is present — mirroring the teacher's `load_config`.
pub fn load_config() -> anyhow::Result<(Config, PathBuf)> {
    let config_path = std::env::var("CARAPACE_CONFIG").unwrap_or_else(|_| "carapace.toml".into());
    let path = PathBuf::from(&config_path);

    let config = if path.exists() {
        let raw = fs::read_to_string(&path).map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        Config::from_toml_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?
    } else {
        Config::default()
    };

    Ok((config, path))
}

/// Write the current process PID to `path` and hold an exclusive lock for
/// as long as the returned handle lives. A second `start` against the same
/// home directory fails immediately rather than racing the first.
pub fn write_pid_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .read(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("opening PID file {}: {e}", path.display()))?;

    file.try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("another carapace instance is running (PID file {} is locked)", path.display()))?;

    let pid = std::process::id();
    {
        let mut f = &file;
        writeln!(f, "{pid}")?;
        f.flush()?;
    }

    tracing::info!(path = %path.display(), pid, "PID file written");
    Ok(file)
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// `stop`: read the PID file and send `SIGTERM`. Out of core scope — the
/// supervisor's own graceful-shutdown path (triggered by the signal, not
/// by this command) does the actual teardown work.
pub fn stop(pid_path: &Path) -> anyhow::Result<bool> {
    let Some(pid) = read_pid_file(pid_path) else {
        println!("no PID file at {}; is a supervisor running?", pid_path.display());
        return Ok(false);
    };

    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill").arg(pid.to_string()).status()?;
        if status.success() {
            println!("sent SIGTERM to pid {pid}");
            return Ok(true);
        }
        println!("failed to signal pid {pid} (already exited?)");
        return Ok(false);
    }

    #[cfg(not(unix))]
    {
        println!("stop is only supported on unix targets");
        Ok(false)
    }
}

/// Reports whether a supervisor looks alive. Each session gets its own
/// socket file under `sockets_dir` (see `UnixRequestSocket`), so liveness is
/// judged from the pid file plus the directory's existence rather than any
/// single well-known socket path.
pub fn status(pid_path: &Path, sockets_dir: &Path) -> bool {
    match read_pid_file(pid_path) {
        Some(pid) if sockets_dir.is_dir() => {
            println!("running (pid {pid}, sockets dir {})", sockets_dir.display());
            true
        }
        Some(pid) => {
            println!(
                "pid file present ({pid}) but sockets dir {} is missing; stale?",
                sockets_dir.display()
            );
            false
        }
        None => {
            println!("not running");
            false
        }
    }
}

/// `doctor`: non-fatal config structural checks only, per `spec.md` §1
/// ("container image build, doctor checks, ... concrete plugin business
/// logic" are out of core scope). Reports `CheckResult`s; never touches a
/// live `Supervisor`.
pub fn doctor(config: &Config, config_path: &Path) -> Vec<CheckResult> {
    let mut results = Vec::new();

    let exists = config_path.exists();
    results.push(CheckResult {
        name: "config file",
        status: if exists { CheckStatus::Pass } else { CheckStatus::Warn },
        detail: if exists {
            config_path.display().to_string()
        } else {
            format!("{} not found; using built-in defaults", config_path.display())
        },
        fix: if exists { None } else { Some("create a carapace.toml, or set CARAPACE_CONFIG") },
    });

    let issues = config.validate();
    let errors = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).count();
    results.push(CheckResult {
        name: "config validation",
        status: if errors > 0 {
            CheckStatus::Fail
        } else if issues.is_empty() {
            CheckStatus::Pass
        } else {
            CheckStatus::Warn
        },
        detail: format!("{} issue(s), {errors} error(s)", issues.len()),
        fix: if errors > 0 { Some("fix the reported fields before starting") } else { None },
    });

    for runtime in &config.containers.runtimes {
        let found = which(runtime);
        results.push(CheckResult {
            name: "container runtime",
            status: if found { CheckStatus::Pass } else { CheckStatus::Warn },
            detail: format!("{runtime}: {}", if found { "found on PATH" } else { "not found on PATH" }),
            fix: if found { None } else { Some("install the runtime or remove it from containers.runtimes") },
        });
    }

    results
}

fn which(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

/// `uninstall`: remove persisted state under the configured home
/// directory. Refuses to run while a PID file indicates a live supervisor.
pub fn uninstall(home: &Path, pid_path: &Path) -> anyhow::Result<bool> {
    if read_pid_file(pid_path).is_some() {
        println!("a supervisor appears to be running; stop it first");
        return Ok(false);
    }
    if home.exists() {
        fs::remove_dir_all(home)?;
    }
    println!("removed {}", home.display());
    Ok(true)
}

pub fn print_results(results: &[CheckResult]) -> bool {
    for result in results {
        result.print();
    }
    !results.iter().any(|r| r.status == CheckStatus::Fail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_remove_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("test.pid");

        let handle = write_pid_file(&pid_path).unwrap();
        let content = fs::read_to_string(&pid_path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());

        assert!(write_pid_file(&pid_path).is_err());

        drop(handle);
        remove_pid_file(&pid_path);
        assert!(!pid_path.exists());
    }

    #[test]
    fn status_reports_not_running_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("missing.pid");
        let sockets_dir = dir.path().join("sockets");
        assert!(!status(&pid_path, &sockets_dir));
    }

    #[test]
    fn doctor_flags_missing_config_file_as_warning() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("carapace.toml");
        let results = doctor(&Config::default(), &config_path);
        let config_check = results.iter().find(|r| r.name == "config file").unwrap();
        assert_eq!(config_check.status, CheckStatus::Warn);
    }

    #[test]
    fn doctor_fails_on_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("carapace.toml");
        let mut config = Config::default();
        config.rate_limit.burst_size = 0;
        let results = doctor(&config, &config_path);
        assert!(!print_results(&results));
    }

    #[test]
    fn uninstall_refuses_while_pid_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(&home).unwrap();
        let pid_path = dir.path().join("carapace.pid");
        let _handle = write_pid_file(&pid_path).unwrap();

        assert!(!uninstall(&home, &pid_path).unwrap());
        assert!(home.exists());
    }
}
