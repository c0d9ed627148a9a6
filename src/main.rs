use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use storefront::analytics::ChannelSink;
use storefront::cache::{CacheStore, MemoryStore, ReadThroughCache, RedisStore};
use storefront::config::{AppConfig, CacheBackend, CacheConfig};
use storefront::storefront::handler::StorefrontState;
use storefront::tracking::handler::TrackingState;
use storefront::types::ProcessedPageView;
use storefront::{pipeline, routes, storage};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};

#[derive(Parser)]
#[command(name = "storefront", about = "Public storefront read path and visitor analytics")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storefront=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))?;

    if let Err(msg) = config.validate() {
        eprintln!("Configuration error: {msg}");
        return Err(msg.into());
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        db = %config.database.path.display(),
        "starting storefront"
    );

    // Setup SQLite pool
    let pool = storage::sqlite::create_pool(&config.database)?;
    storage::sqlite::init_pool(&pool).await?;
    tracing::info!("database initialized");

    let store = connect_cache_store(&config.cache).await;
    tracing::info!(
        backend = store.name(),
        ttl_secs = config.cache.ttl_secs,
        single_flight = config.cache.single_flight,
        "cache ready"
    );

    // Setup MPSC channel
    let (tx, rx) = mpsc::channel::<ProcessedPageView>(config.tracking.channel_capacity);

    // Spawn pipeline worker
    let worker_pool = pool.clone();
    let pipeline_config = config.pipeline.clone();
    let worker_handle = tokio::spawn(async move {
        pipeline::worker::run_worker(rx, worker_pool, pipeline_config).await;
    });

    // Build shared state
    let sink = ChannelSink::new(tx);
    let cache = ReadThroughCache::new(store, config.cache.single_flight);
    let storefront_state = Arc::new(StorefrontState {
        pool: pool.clone(),
        invalidator: cache.invalidator(),
        cache,
        ttl_secs: config.cache.ttl_secs,
        tracking: sink.clone(),
    });
    let tracking_state = Arc::new(TrackingState {
        config: config.tracking.clone(),
        sink,
    });

    // Rate limiter for the tracking ingress
    let governor_conf = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .per_second(config.rate_limit.per_second)
        .burst_size(config.rate_limit.burst_size)
        .finish()
        .ok_or("invalid rate limit config")?;

    let tracking_routes = routes::tracking_routes(tracking_state.clone())
        .layer(GovernorLayer::new(governor_conf))
        .layer(routes::public_cors());

    let app = routes::storefront_routes(storefront_state).merge(tracking_routes);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drop the last sender so the pipeline worker drains and exits
    drop(tracking_state);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), worker_handle).await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Pick the configured backend. An unreachable Redis degrades to the
/// in-process store rather than failing startup.
async fn connect_cache_store(config: &CacheConfig) -> Arc<dyn CacheStore> {
    let memory = || -> Arc<dyn CacheStore> { Arc::new(MemoryStore::new(config.max_capacity)) };

    match (config.backend, config.redis_url.as_deref()) {
        (CacheBackend::Redis, Some(url)) => match RedisStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, "redis unavailable, falling back to in-memory cache");
                memory()
            }
        },
        _ => memory(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutting down...");
}
