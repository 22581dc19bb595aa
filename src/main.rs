//! Agent orchestrator daemon - main entry point.
//!
//! Loads configuration, installs the signal handler and runs the daemon
//! until SIGINT/SIGTERM.

use std::path::PathBuf;

use agent_orchestrator::config::Config;
use agent_orchestrator::daemon;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Optional explicit config path as the only argument.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(
        repository = %config.repository.path.display(),
        backlog = %config.scheduler.backlog_path.display(),
        agents = config.agents.count,
        "starting agent orchestrator"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if let Err(e) = daemon::run(config, cancel).await {
        tracing::error!(error = %e, "daemon failed");
        std::process::exit(1);
    }
}

/// Cancels the token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }

        tracing::info!("received shutdown signal, stopping");
        cancel.cancel();
    });
}
