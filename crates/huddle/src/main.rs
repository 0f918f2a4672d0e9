//! # huddle
//!
//! Huddle server binary. Loads settings, installs logging and metrics,
//! wires the auth and storage collaborators and serves until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_server::auth::StaticTokenAuthenticator;
use huddle_server::storage::DirectoryFileStore;
use huddle_server::{ChatServer, ServerConfig};
use huddle_settings::HuddleSettings;

/// Room-based chat and file sharing server.
#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Room-based WebSocket chat server")]
struct Cli {
    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file. Defaults to `~/.huddle/settings.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `huddle_server=trace`.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut HuddleSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn load(cli: &Cli) -> Result<HuddleSettings> {
    let mut settings = match &cli.config {
        Some(path) => huddle_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => huddle_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    huddle_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let authenticator = Arc::new(StaticTokenAuthenticator::from_settings(&settings.auth));
    if settings.auth.tokens.is_empty() && !settings.auth.allow_anonymous {
        tracing::warn!("no tokens configured and anonymous access disabled, all upgrades will fail");
    }
    let store = Arc::new(DirectoryFileStore::new(
        &settings.storage.root_dir,
        settings.storage.public_url_prefix.clone(),
    ));

    let mut server = ChatServer::new(ServerConfig::from(&settings), authenticator, store);
    match huddle_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled"),
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        storage = %settings.storage.root_dir,
        "huddle listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().graceful_shutdown(None).await;
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
