use std::sync::Arc;

use anyhow::Context;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reelfeed::{
    api::{create_router, AppState},
    config::Config,
    db::{create_redis_client, DocumentStore, RedisStore, TieredCache},
    middleware::{make_span_with_request_id, request_id_middleware},
    services::{
        providers::DisabledCriticScores, CatalogProvider, CriticScoreProvider, EngineSettings,
        FeedEngine, OmdbProvider, TmdbProvider,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    let redis_client = create_redis_client(&config.redis_url)?;
    let durable: Arc<dyn DocumentStore> = Arc::new(RedisStore::new(redis_client));
    let cache = Arc::new(TieredCache::new(durable, &config.cache()));

    let catalog_provider: Arc<dyn CatalogProvider> = Arc::new(TmdbProvider::new(
        cache.clone(),
        &config.cache(),
        config.tmdb_api_key.clone(),
        config.tmdb_api_url.clone(),
    ));
    let critic_provider: Arc<dyn CriticScoreProvider> = match &config.omdb_api_key {
        Some(api_key) => Arc::new(OmdbProvider::new(
            cache.clone(),
            &config.cache(),
            api_key.clone(),
            config.omdb_api_url.clone(),
        )),
        None => {
            tracing::warn!("OMDB_API_KEY not set, critic scores disabled");
            Arc::new(DisabledCriticScores)
        }
    };

    if config.feed_user_id.is_none() {
        tracing::info!("FEED_USER_ID not set, discovery cursors stored under the local document");
    }

    let engine = Arc::new(FeedEngine::new(
        catalog_provider,
        critic_provider,
        cache,
        EngineSettings::from_config(&config),
    ));

    // Warm the snapshot without blocking startup
    let warm = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = warm.catalog().ensure_catalog(false, true, false).await {
            tracing::warn!(error = %e, "Initial catalog load failed");
        }
    });

    let app = create_router(AppState::new(engine.clone())).layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id))
            .layer(CorsLayer::permissive()),
    );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(address = %addr, "Server running");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutdown signal received");
}
