use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use connect_directoryd::api;
use connect_directoryd::cast::TlsCastTransport;
use connect_directoryd::config::Config;
use connect_directoryd::webapi::{RefreshTokenProvider, SpclientDeviceAuth, SpotifyWebApi};
use connect_directoryd::{ActivationTimeouts, Collaborators, DirectoryTask};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("connect_directoryd=info"))
        )
        .init();

    tracing::info!("Starting connect-directoryd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/connect-directoryd/connect-directoryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Collaborators
    let tokens = Arc::new(RefreshTokenProvider::new(
        config.account.client_id.clone(),
        config.account.refresh_token.clone(),
    ));
    let collaborators = Collaborators {
        web_api: Arc::new(SpotifyWebApi::new(tokens.clone())),
        tokens,
        device_auth: Arc::new(SpclientDeviceAuth::new()),
        transport: Arc::new(TlsCastTransport::default()),
        speakers: None,
    };

    let timeouts = ActivationTimeouts::from(&config.activation);
    let listen = config.api.listen.clone();

    // Start directory task; discovery runs on its own threads
    let task = tokio::task::spawn_blocking(move || DirectoryTask::start(config, collaborators))
        .await
        .context("Directory task startup aborted")?
        .context("Failed to start directory task")?;
    let task = Arc::new(task);
    let hash_rx = task.directory().fingerprint_receiver();

    // Build API router
    let app_state = api::routes::AppState {
        task: task.clone(),
        hash_rx,
        timeouts,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;

    tracing::info!("API listening on {}", listen);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = server_handle.await;

    // Stop sessions, discovery and the directory
    if let Err(e) = tokio::task::spawn_blocking(move || task.stop()).await {
        tracing::error!("Failed to stop directory task: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
