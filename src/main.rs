use hallrelay::config::RelayConfig;
use hallrelay::services::canvas;
use hallrelay::{db, routes, state};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::from_env().expect("invalid relay configuration");
    let port = config.port;

    let store = db::connect(&config).await.expect("database init failed");
    let state = state::AppState::new(store, config).with_persistence_worker();

    // Non-fatal: an unreadable log starts the canvas empty.
    if let Err(e) = canvas::hydrate(&state).await {
        tracing::warn!(error = %e, "canvas hydration failed; starting with an empty canvas");
    }
    match state.moderation.refresh_profanity().await {
        Ok(count) => tracing::info!(count, "profanity list loaded"),
        Err(e) => tracing::warn!(error = %e, "profanity list unavailable; masking disabled"),
    }

    let app = routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "hallrelay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    // Upgraded sockets outlive `serve`; end them and flush queued writes.
    state.stop().await;
    tracing::info!("hallrelay stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
