use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnstile_api::worker::{start_cleanup_worker, start_order_expiry_worker, BrokerDispatcher};
use turnstile_api::{app, AppState, EngineSettings, Metrics};
use turnstile_core::clock::{Clock, SystemClock};
use turnstile_core::finalize::FinalizationListener;
use turnstile_core::reaper::OrderExpiryReaper;
use turnstile_core::reconcile::ReconciliationListener;
use turnstile_core::repository::{CounterStore, HoldStore, LedgerRepository};
use turnstile_core::sweeper::CleanupSweeper;
use turnstile_store::app_config::Config;
use turnstile_store::{DbClient, EventConsumer, RedisClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "turnstile_api=debug,turnstile_core=info,turnstile_store=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Turnstile on port {}", config.server.port);

    // Redis Connection
    let redis = Arc::new(
        RedisClient::new(&config.redis.url(), &config.redis.key_prefix)
            .await
            .context("Failed to connect to Redis")?,
    );
    redis.ping().await.context("Redis did not answer PING")?;

    // Ledger
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let ledger: Arc<dyn LedgerRepository> = Arc::new(db);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    let app_state = AppState::build(
        redis.clone(),
        ledger.clone(),
        clock.clone(),
        EngineSettings {
            holds: config.holds.clone(),
            queue: config.queue.clone(),
            rate_limits: config.rate_limits.clone(),
        },
        metrics.clone(),
    );

    // Background workers
    let sweeper = CleanupSweeper::new(
        redis.clone() as Arc<dyn HoldStore>,
        clock.clone(),
        config.cleanup.clone(),
    );
    tokio::spawn(start_cleanup_worker(sweeper, metrics.clone()));

    let reaper = OrderExpiryReaper::new(
        ledger.clone(),
        app_state.holds.clone(),
        clock.clone(),
        config.order_expiry.clone(),
    );
    tokio::spawn(start_order_expiry_worker(reaper, metrics.clone()));

    // Kafka Consumers
    let kafka = &config.kafka;
    let consumer = EventConsumer::new(
        &kafka.brokers,
        &kafka.group_id,
        &[kafka.capacity_topic.as_str(), kafka.order_paid_topic.as_str()],
        kafka.max_attempts,
        kafka.retry_backoff_ms,
    )
    .context("Failed to create Kafka consumer")?;
    let dispatcher = BrokerDispatcher::new(
        kafka.capacity_topic.clone(),
        kafka.order_paid_topic.clone(),
        ReconciliationListener::new(redis.clone() as Arc<dyn CounterStore>),
        FinalizationListener::new(app_state.holds.clone(), ledger),
        metrics,
    );
    tokio::spawn(async move { consumer.run(&dispatcher).await });

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
