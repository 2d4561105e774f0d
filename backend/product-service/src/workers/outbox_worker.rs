use rdkafka::producer::FutureProducer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use transactional_outbox::{
    metrics::OutboxMetrics, KafkaOutboxPublisher, OutboxProcessor, SqlxOutboxRepository,
};

use crate::config::OutboxConfig;

/// Relay pending product events from the outbox to Kafka until shutdown.
pub async fn run(
    repo: Arc<SqlxOutboxRepository>,
    producer: FutureProducer,
    delivery_timeout: Duration,
    config: OutboxConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(
        batch_size = config.batch_size,
        poll_interval_secs = config.poll_interval_secs,
        max_retries = config.max_retries,
        "Starting product-service outbox worker"
    );

    let publisher = Arc::new(KafkaOutboxPublisher::new(producer, delivery_timeout));
    let processor = OutboxProcessor::new(
        repo,
        publisher,
        config.batch_size,
        config.poll_interval(),
        config.max_retries,
    )
    .with_metrics(OutboxMetrics::new("product_service"));

    processor.run(shutdown).await
}
