//! Process entry point. Parses the CLI, and for every subcommand but
//! `start` delegates to a thin stub in `cli.rs`. `start` is the only path
//! that builds a `Supervisor`: load config, init tracing, bootstrap every
//! subsystem, write the PID file, block on a shutdown signal, tear down.
//!
//! Grounded on the teacher's `main.rs` dispatch-by-subcommand shape and its
//! `shutdown_signal` pattern, adapted from `inbox-autopilot/daemon/src/main.rs`'s
//! `ctrl_c`/`SIGTERM` select (the teacher's own `main.rs` blocks on
//! `axum::serve` instead, which has no equivalent here since Carapace has no
//! HTTP surface).

use clap::Parser;
use tracing_subscriber::EnvFilter;

use carapace_gateway::cli::{self, AuthCommand, Cli, Command};
use carapace_gateway::supervisor::{expand_home, Supervisor};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,carapace=debug")))
        .json()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => {
            init_tracing();
            run().await
        }
        Command::Stop => {
            let (config, _) = cli::load_config()?;
            let pid_path = home_dir(&config).join("pid");
            let ok = cli::stop(&pid_path)?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Status => {
            let (config, _) = cli::load_config()?;
            let home = home_dir(&config);
            let running = cli::status(&home.join("pid"), &home.join("sockets"));
            if !running {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Doctor => {
            let (config, config_path) = cli::load_config()?;
            let results = cli::doctor(&config, &config_path);
            if !cli::print_results(&results) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Uninstall => {
            let (config, _) = cli::load_config()?;
            let home = home_dir(&config);
            let ok = cli::uninstall(&home, &home.join("pid"))?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Auth(auth) => run_auth(auth),
    }
}

fn home_dir(config: &carapace_domain::config::Config) -> std::path::PathBuf {
    expand_home(&config.home)
}

/// Out of core scope (`spec.md` §1): the supervisor never authenticates
/// its own operator. These stubs hold the exit-code contract so `auth` is
/// a well-formed CLI surface without implementing credential storage here.
fn run_auth(auth: AuthCommand) -> anyhow::Result<()> {
    match auth {
        AuthCommand::ApiKey { plugin, key } => {
            println!("would store an API key for {plugin}/{key} under the plugin host's credentials root");
            Ok(())
        }
        AuthCommand::Login { plugin } => {
            println!("would run an OAuth device-code flow for {plugin}");
            Ok(())
        }
        AuthCommand::Status { plugin, key } => {
            println!("would report presence of credential {plugin}/{key} without revealing its value");
            Ok(())
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let (config, _config_path) = cli::load_config()?;

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            carapace_domain::config::ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            carapace_domain::config::ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == carapace_domain::config::ConfigSeverity::Error) {
        anyhow::bail!("config validation failed with {} error(s)", issues.iter().filter(|i| i.severity == carapace_domain::config::ConfigSeverity::Error).count());
    }

    let home = home_dir(&config);
    let pid_path = home.join("pid");
    let pid_handle = cli::write_pid_file(&pid_path)?;

    let supervisor = Supervisor::bootstrap(config).await?;

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    supervisor.shutdown().await;
    drop(pid_handle);
    cli::remove_pid_file(&pid_path);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
