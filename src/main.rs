use anyhow::{Context, Result};
use callrelay::{Orchestrator, OrchestratorConfig, build_router};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = OrchestratorConfig::from_env().context("failed to load orchestrator configuration")?;
    match &config.queue_journal {
        Some(path) => info!(path = %path.display(), "queue backend: journal"),
        None => info!("queue backend: memory"),
    }

    let orchestrator = Orchestrator::from_config(config)
        .await
        .context("failed to initialize orchestrator")?;
    orchestrator.start().await;

    let app = build_router(orchestrator.clone());

    let addr = orchestrator.config().address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(
        address = %addr,
        workers = orchestrator.config().static_workers.len(),
        "callrelay started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    orchestrator
        .shutdown()
        .await
        .context("failed to stop dispatch consumers")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("callrelay=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
