use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use promptbench::{config::Config, handlers, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("promptbench=info".parse()?),
        )
        .init();

    let config = Config::from_env();
    config.print_banner();

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

    let addr = format!("0.0.0.0:{}", config.port);
    let engine = Arc::new(Engine::open(config).await?);

    for run in engine.interrupted_runs().await? {
        warn!(
            run_id = %run.id,
            project = %run.project,
            "Run was interrupted ({}/{} items finished); resume it to continue",
            run.finished,
            run.total
        );
    }

    let state = Arc::new(handlers::AppState {
        engine: engine.clone(),
    });
    let app = handlers::router(state);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, draining...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    engine.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
