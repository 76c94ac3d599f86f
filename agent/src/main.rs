//! Sentinel Agent - offline-first location sync and geofence alerting.
//!
//! Runs the sync workers and alert dispatcher for the configured devices
//! and serves the local control API.

use std::sync::Arc;

use sentinel_agent::alerts::{LogChannel, NotificationChannel, WebhookChannel};
use sentinel_agent::config::Config;
use sentinel_agent::remote::HttpRemoteStore;
use sentinel_agent::store::LocalEventStore;
use sentinel_agent::summary::{HttpSummarizer, Summarizer};
use sentinel_agent::{Agent, AgentParts};
use sentinel_engine::GeofenceSet;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentinel_agent=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        "Starting Sentinel Agent on {}:{} for {} device(s)",
        config.host,
        config.port,
        config.device_ids.len()
    );

    let geofences = match &config.geofences_path {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            let set = GeofenceSet::from_json(&json)?;
            tracing::info!(count = set.len(), path = %path.display(), "Loaded geofences");
            set
        }
        None => {
            tracing::warn!("No GEOFENCES_PATH set, running without geofences");
            GeofenceSet::new()
        }
    };

    // Open the local store and run migrations
    tracing::info!("Opening local store...");
    let store = Arc::new(LocalEventStore::open(&config.database_url, config.max_local_records).await?);

    let remote = Arc::new(HttpRemoteStore::new(&config.remote_url, config.request_timeout)?);
    let channel: Arc<dyn NotificationChannel> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookChannel::new(url, config.request_timeout)?),
        None => Arc::new(LogChannel),
    };
    let summarizer: Option<Arc<dyn Summarizer>> = match &config.summary_url {
        Some(url) => Some(Arc::new(HttpSummarizer::new(url, config.request_timeout)?)),
        None => None,
    };

    let agent = Agent::start(
        &config,
        store,
        AgentParts {
            remote,
            channel,
            summarizer,
            geofences,
        },
    )
    .await?;

    // Build router
    let app = agent
        .router()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Control API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    agent.shutdown().await;
    Ok(())
}
