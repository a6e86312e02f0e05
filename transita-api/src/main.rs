use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transita_api::{
    app,
    metrics::Metrics,
    state::{AppState, AuthConfig},
    worker,
};
use transita_booking::{gateway::build_gateway, Engine, EngineSettings};
use transita_core::audit::{AuditSink, TracingAuditSink};
use transita_core::SystemClock;
use transita_store::{DbClient, EventProducer, KafkaAuditSink, RedisClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transita_api=debug,transita_booking=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = transita_store::app_config::Config::load().context("Failed to load config")?;
    tracing::info!("Starting Transita API on port {}", config.server.port);

    // Database
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    // Redis (optional, rate limiting only)
    let redis = match config.redis.url.as_deref() {
        Some(url) => match RedisClient::new(url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!("Redis unavailable, rate limiting disabled: {}", e);
                None
            }
        },
        None => None,
    };

    // Audit sink: Kafka when configured
    let audit: Arc<dyn AuditSink> = match config.kafka.brokers.as_deref() {
        Some(brokers) => {
            let producer = EventProducer::new(brokers).context("Failed to create Kafka producer")?;
            Arc::new(KafkaAuditSink::new(producer))
        }
        None => Arc::new(TracingAuditSink),
    };

    let gateway = build_gateway(&config.gateway)?;
    let engine = Engine::new(
        db.repositories(),
        gateway,
        audit,
        Arc::new(SystemClock),
        EngineSettings::from_config(&config),
    );
    let metrics = Arc::new(Metrics::new()?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = worker::start_scheduler(engine.clone(), metrics.clone(), &config.jobs, shutdown_rx);

    let app_state = AppState {
        engine,
        redis,
        metrics,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
        rate_limit_per_minute: config.redis.rate_limit_per_minute,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(app_state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping job scheduler");
    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::warn!("job task ended abnormally: {}", e);
        }
    }
    db.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C signal");
}
