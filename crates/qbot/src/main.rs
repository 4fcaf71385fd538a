use std::sync::Arc;

use tracing::info;

use qbot_core::config::Config;
use qbot_gateway::api::ApiClient;
use qbot_gateway::supervisor::Supervisor;
use qbot_gateway::token::TokenManager;

#[tokio::main]
async fn main() -> Result<(), qbot_core::Error> {
    qbot_core::logging::init("qbot")?;

    let cfg = Arc::new(Config::load()?);
    let tokens = TokenManager::new(&cfg);
    let api = ApiClient::new(&cfg, tokens.clone());
    let supervisor = Supervisor::new(cfg, tokens, api);

    supervisor.start().await?;
    info!("qbot running, press ctrl-c to stop");

    shutdown_signal().await;
    supervisor.stop().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
