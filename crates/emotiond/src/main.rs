use anyhow::{Context, Result};
use emotion_core::{DetectorVariant, FacePipeline, ModelArtifacts};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod routes;
mod upload;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "emotiond starting");

    let config = config::Config::load()?;
    tracing::info!(
        addr = %config.bind_addr(),
        model_dir = %config.model_dir.display(),
        public_dir = %config.public_dir.display(),
        upload_dir = %config.upload_dir.display(),
        max_upload_bytes = config.max_upload_bytes,
        timeout_secs = config.request_timeout_secs,
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.upload_dir).with_context(|| {
        format!("creating upload directory {}", config.upload_dir.display())
    })?;

    let artifacts = ModelArtifacts::in_dir(&config.model_dir, DetectorVariant::Fast);
    for path in artifacts.missing() {
        tracing::error!(path = %path.display(), "model file not found");
    }

    let engine = engine::spawn_engine(
        config.inference_workers,
        config.queue_depth,
        || FacePipeline::load(&artifacts).map_err(anyhow::Error::from),
    )
    .context("loading inference models")?;

    let state = routes::AppState {
        engine,
        settings: Arc::new(routes::Settings::from(&config)),
    };
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    tracing::info!(addr = %config.bind_addr(), "emotiond ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tracing::info!("emotiond shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
