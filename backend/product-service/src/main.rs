use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use offset_watermark::OffsetWatermark;
use product_service::config::Config;
use product_service::consumers::{
    DeadLetterProducer, MergeHandler, ProductEventsConsumer, WorkerState,
};
use product_service::handlers;
use product_service::metrics::{metrics_handler, MergeMetrics};
use product_service::repository::{PgProductRepository, ProductStore};
use product_service::services::ProductService;
use product_service::workers::outbox_worker;
use transactional_outbox::SqlxOutboxRepository;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,product_service=debug".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("🔧 Starting product-service");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        "✅ Configuration loaded: env={}, http_port={}, inbound={}, outbound={}",
        config.app.env,
        config.app.http_port,
        config.kafka.inbound_topic,
        config.kafka.outbound_topic
    );

    // Initialize database pool; shared by handlers, relay and merge worker
    let pg_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    sqlx::query("SELECT 1")
        .execute(&pg_pool)
        .await
        .context("Failed to verify database connection")?;
    info!("✅ Database pool created and verified");

    sqlx::migrate!("./migrations")
        .run(&pg_pool)
        .await
        .context("Failed to run database migrations")?;
    info!("✅ Database migrations completed");

    // One long-lived producer for the outbox relay and the DLQ
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka.brokers)
        .set("client.id", &config.kafka.client_id)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("max.in.flight.requests.per.connection", "5")
        .set("retries", "10")
        .create()
        .context("Failed to create Kafka producer")?;
    info!("✅ Kafka producer initialized");

    let outbox_repo = Arc::new(SqlxOutboxRepository::new(pg_pool.clone()));
    let store: Arc<dyn ProductStore> =
        Arc::new(PgProductRepository::new(pg_pool.clone(), outbox_repo.clone()));
    let product_service = ProductService::new(store.clone(), config.kafka.outbound_topic.clone());
    info!("✅ Product service initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
    let broker = resilience::broker_reconnect_config();
    let apply = resilience::store_apply_config();

    let mut join_set = JoinSet::new();

    // Merge worker
    let merge_metrics = MergeMetrics::new();
    let mut apply_retry = apply.retry.unwrap_or_default();
    apply_retry.max_retries = config.consumer.apply_max_retries;
    let handler = MergeHandler::new(
        store.clone(),
        Arc::new(OffsetWatermark::new()),
        apply_retry,
        config.consumer.apply_timeout(),
        merge_metrics.clone(),
    );
    let dead_letters = DeadLetterProducer::new(
        producer.clone(),
        config.kafka.dlq_topic.clone(),
        broker.timeout.duration,
    );
    let consumer = ProductEventsConsumer::new(
        &config.kafka,
        handler,
        dead_letters,
        merge_metrics,
        broker.retry.clone().unwrap_or_default(),
        state_tx,
    )
    .context("Failed to start product events consumer")?;
    let consumer_shutdown = shutdown_rx.clone();
    join_set.spawn(async move {
        consumer
            .run(consumer_shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Product events consumer error: {}", e))
    });
    info!("✅ Product events consumer started");

    // Outbox relay
    join_set.spawn(outbox_worker::run(
        outbox_repo.clone(),
        producer,
        broker.timeout.duration,
        config.outbox.clone(),
        shutdown_rx.clone(),
    ));
    info!("✅ Outbox worker started");

    let http_addr = format!("{}:{}", config.app.host, config.app.http_port);
    let outbox_admin_enabled = config.outbox.admin_enabled;
    let http_server = HttpServer::new(move || {
        let mut app = App::new()
            .app_data(web::Data::new(product_service.clone()))
            .app_data(web::Data::new(state_rx.clone()))
            .app_data(handlers::json_config())
            .route("/health", web::get().to(handlers::health::health))
            .route("/ready", web::get().to(handlers::health::ready))
            .route("/metrics", web::get().to(metrics_handler))
            .configure(handlers::products::configure);

        if outbox_admin_enabled {
            app = app
                .app_data(web::Data::new(outbox_repo.clone()))
                .configure(handlers::admin::configure);
        }

        app
    })
    .bind(&http_addr)
    .context("Failed to bind HTTP server")?
    .disable_signals()
    .run();

    let server_handle = http_server.handle();
    join_set.spawn(async move {
        http_server
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))
    });
    info!("🚀 HTTP server listening on http://{}", http_addr);
    info!("🎉 product-service is running");

    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
        Some(result) = join_set.join_next() => {
            failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(e) => Some(anyhow::anyhow!("Task panicked: {}", e)),
            };
        }
    }

    info!("🛑 product-service shutting down");
    let _ = shutdown_tx.send(true);
    server_handle.stop(true).await;

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Task failed: {:#}", e),
            Err(e) => tracing::error!("Task panicked: {:#}", e),
        }
    }

    pg_pool.close().await;
    info!("✅ Database pool closed");

    match failure {
        Some(e) => {
            tracing::error!("Task failed: {:#}", e);
            Err(e)
        }
        None => Ok(()),
    }
}
