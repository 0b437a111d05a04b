//! ptyhub-server: multi-tenant PTY session server.
//!
//! Runs one pseudo-terminal backed agent process per session, scoped to the
//! user who created it, and exposes the session API as JSON over WebSocket.

mod auth;
mod config;
mod server;
mod session;
mod store;
mod transport;

use anyhow::Context;
use auth::AuthGate;
use clap::Parser;
use config::{CliOverrides, ServerConfig};
use ptyhub_core::CredentialCipher;
use server::PtyHubServer;
use session::{NativePtySpawner, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use store::{FileStore, SessionStore};
use tracing::{error, info, warn};

/// ptyhub-server: PTY-backed agent sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "ptyhub-server", version, about = "Multi-tenant PTY session server")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ptyhub/config.toml")]
    config: String,

    /// Maximum live sessions per user
    #[arg(long)]
    max_per_user: Option<usize>,

    /// Idle timeout in minutes
    #[arg(long)]
    timeout_minutes: Option<u64>,

    /// Base directory for session workspaces
    #[arg(long)]
    workspace_base: Option<String>,

    /// Agent command to run in each session
    #[arg(long)]
    agent_command: Option<String>,

    /// Directory for the JSON session store
    #[arg(long)]
    store: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ptyhub-server");

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "ptyhub-server failed");
        std::process::exit(1);
    }

    info!("ptyhub-server stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = CliOverrides {
        bind: cli.bind,
        max_per_user: cli.max_per_user,
        timeout_minutes: cli.timeout_minutes,
        workspace_base: cli.workspace_base,
        agent_command: cli.agent_command,
        store_path: cli.store,
    };
    let config_path = PathBuf::from(&cli.config);
    let config =
        ServerConfig::load(Some(&config_path), &overrides).context("failed to load config")?;
    info!(?config, "configuration loaded");

    std::fs::create_dir_all(&config.manager.workspace_base).with_context(|| {
        format!(
            "cannot create workspace base {}",
            config.manager.workspace_base.display()
        )
    })?;

    let gate = AuthGate::new(config.api_token.as_deref()).context("failed to set up auth")?;
    if !gate.is_enabled() {
        warn!(
            "NO API TOKEN CONFIGURED: authentication is disabled and any client can act as any user. \
             Set {} or [server] api_token.",
            config::ENV_API_TOKEN
        );
    }

    let mut manager = SessionManager::new(config.manager.clone(), Arc::new(NativePtySpawner));

    if let Some(path) = &config.store_path {
        let store = FileStore::open(path)
            .with_context(|| format!("cannot open session store {}", path.display()))?;
        let reconciled = store
            .reconcile_after_restart()
            .context("store reconciliation failed")?;
        if reconciled > 0 {
            warn!(count = reconciled, "marked sessions from a previous run as terminated");
        }
        manager = manager.with_store(Arc::new(store));
        info!(path = %path.display(), "session store enabled");
    }

    match &config.encryption_key {
        Some(key) => {
            let cipher = CredentialCipher::from_hex(key).context("invalid encryption key")?;
            manager = manager.with_cipher(Arc::new(cipher));
        }
        None if config.store_path.is_some() => {
            warn!(
                "no encryption key configured: session credentials will not be persisted (set {})",
                config::ENV_ENCRYPTION_KEY
            );
        }
        None => {}
    }

    let manager = Arc::new(manager);
    let background = manager.start_background_tasks();

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    info!(addr = %config.bind, "listening");
    let server = PtyHubServer::new(&config, manager.clone(), gate);

    // Run until shutdown signal
    let outcome = tokio::select! {
        result = server.run(listener) => result.context("server error"),
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    for task in background {
        task.abort();
    }
    manager.shutdown().await;
    outcome
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
