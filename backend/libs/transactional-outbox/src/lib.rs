//! # Transactional Outbox Pattern Implementation
//!
//! This library implements the Transactional Outbox pattern so that a product
//! write and the domain event announcing it are committed atomically, and the
//! event reaches Kafka even if the broker is unavailable at write time.
//!
//! ## What is the Transactional Outbox Pattern?
//!
//! 1. The business write and the event row are inserted in the same transaction
//! 2. Events are stored in the `outbox_events` table next to the business data
//! 3. A background processor reads unpublished events and publishes them to Kafka
//! 4. Events are marked as published only after the broker acknowledged delivery
//!
//! This guarantees **at-least-once delivery** and prevents event loss even if:
//! - The service crashes after database commit but before Kafka publish
//! - Kafka is temporarily unavailable
//! - Network partitions occur
//!
//! A publish failure never turns an already-committed write into an error
//! response; the processor keeps retrying with exponential backoff.
//!
//! ## Usage Example
//!
//! ### 1. Insert data and event in same transaction
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxEvent, OutboxRepository, SqlxOutboxRepository};
//! use sqlx::PgPool;
//!
//! async fn create_product(
//!     pool: &PgPool,
//!     outbox_repo: &SqlxOutboxRepository,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query("INSERT INTO products (id, name) VALUES ($1, $2)")
//!         .bind(42_i64)
//!         .bind("Widget")
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let event = OutboxEvent::new(
//!         "product",
//!         42,
//!         "product.created",
//!         "go-to-rails",
//!         serde_json::json!({ "id": 42, "name": "Widget" }),
//!     );
//!     outbox_repo.insert(&mut tx, &event).await?;
//!
//!     // Both the product and its event become visible together
//!     tx.commit().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Start background processor
//!
//! ```rust,no_run
//! use transactional_outbox::{KafkaOutboxPublisher, OutboxProcessor, SqlxOutboxRepository};
//! use rdkafka::producer::FutureProducer;
//! use rdkafka::ClientConfig;
//! use sqlx::PgPool;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect("postgresql://localhost/catalog").await?;
//!
//!     // One long-lived producer per process, with idempotence enabled
//!     let producer: FutureProducer = ClientConfig::new()
//!         .set("bootstrap.servers", "localhost:9092")
//!         .set("enable.idempotence", "true")
//!         .set("acks", "all")
//!         .create()?;
//!
//!     let repository = Arc::new(SqlxOutboxRepository::new(pool));
//!     let publisher = Arc::new(KafkaOutboxPublisher::new(producer, Duration::from_secs(30)));
//!
//!     let processor = OutboxProcessor::new(
//!         repository,
//!         publisher,
//!         100,                          // batch_size
//!         Duration::from_secs(5),       // poll_interval
//!         5,                            // max_retries
//!     );
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     processor.run(shutdown_rx).await?;
//!
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

/// Represents an event stored in the outbox table.
///
/// Events are created within a database transaction alongside business logic changes,
/// ensuring atomicity. They are later published to Kafka by the background processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Type of aggregate this event relates to (e.g., "product")
    pub aggregate_type: String,

    /// ID of the entity this event relates to; also the Kafka partition key
    pub aggregate_id: i64,

    /// Event type (e.g., "product.created"); sent as a header, never in the payload
    pub event_type: String,

    /// Destination topic
    pub topic: String,

    /// Event payload as JSON
    pub payload: serde_json::Value,

    /// Optional metadata (correlation_id, trace_id, etc.)
    pub metadata: Option<serde_json::Value>,

    /// Timestamp when event was created
    pub created_at: DateTime<Utc>,

    /// Timestamp when the broker acknowledged the event (None = unpublished)
    pub published_at: Option<DateTime<Utc>>,

    /// Number of failed publish attempts
    pub retry_count: i32,

    /// Last error message from failed publish attempt
    pub last_error: Option<String>,

    /// Earliest time of the next publish attempt (None = due now)
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// New pending event with a fresh id and no publish history
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: i64,
        event_type: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            topic: topic.into(),
            payload,
            metadata: None,
            created_at: Utc::now(),
            published_at: None,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Whether the relay may attempt this event at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Repository trait for managing outbox events in the database.
///
/// This trait abstracts database operations to allow for testing and
/// alternative implementations.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new event into the outbox within a transaction.
    ///
    /// This method MUST be called within an existing transaction to ensure
    /// atomicity with business logic changes.
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()>;

    /// Get unpublished events that can be sent now, oldest first.
    ///
    /// Rows at `max_retries` and rows whose backoff has not elapsed are left
    /// out, and so is every later row of the same aggregate: an aggregate's
    /// events are never handed out past an older one that is still pending.
    async fn get_unpublished(&self, limit: i32, max_retries: i32) -> OutboxResult<Vec<OutboxEvent>>;

    /// Mark an event as successfully published.
    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()>;

    /// Increment the retry count, remember the error message and hold the
    /// event back until `retry_at`.
    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> OutboxResult<()>;

    /// Pending count and oldest pending age in seconds (age = 0 if none pending).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-based implementation of OutboxRepository using PostgreSQL.
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Return pending count and oldest pending age (seconds). If no pending, age = 0.
    pub async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE published_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending")?;
        let age: i64 = rec.try_get("age_seconds")?;
        Ok((pending, age))
    }

    /// Replay events created since the given timestamp by resetting published_at and retry counters.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET published_at = NULL,
                retry_count = 0,
                last_error = NULL,
                next_attempt_at = NULL
            WHERE created_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("Failed to replay events since timestamp")?;

        Ok(res.rows_affected())
    }

    /// Replay every event of one aggregate (e.g. one product) for operational backfill.
    pub async fn replay_aggregate(&self, aggregate_type: &str, aggregate_id: i64) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET published_at = NULL,
                retry_count = 0,
                last_error = NULL,
                next_attempt_at = NULL
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .execute(&self.pool)
        .await
        .context("Failed to replay events for aggregate")?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id,
                aggregate_type,
                aggregate_id,
                event_type,
                topic,
                payload,
                metadata,
                created_at,
                published_at,
                retry_count,
                last_error,
                next_attempt_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.topic)
        .bind(&event.payload)
        .bind(&event.metadata)
        .bind(event.created_at)
        .bind(event.published_at)
        .bind(event.retry_count)
        .bind(&event.last_error)
        .bind(event.next_attempt_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert event into outbox")?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            aggregate_id = event.aggregate_id,
            "Event inserted into outbox"
        );

        Ok(())
    }

    async fn get_unpublished(&self, limit: i32, max_retries: i32) -> OutboxResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT
                e.id,
                e.aggregate_type,
                e.aggregate_id,
                e.event_type,
                e.topic,
                e.payload,
                e.metadata,
                e.created_at,
                e.published_at,
                e.retry_count,
                e.last_error,
                e.next_attempt_at
            FROM outbox_events e
            WHERE e.published_at IS NULL
              AND e.retry_count < $2
              AND (e.next_attempt_at IS NULL OR e.next_attempt_at <= NOW())
              AND NOT EXISTS (
                  SELECT 1
                  FROM outbox_events older
                  WHERE older.published_at IS NULL
                    AND older.aggregate_type = e.aggregate_type
                    AND older.aggregate_id = e.aggregate_id
                    AND (older.created_at, older.id) < (e.created_at, e.id)
                    AND (older.retry_count >= $2 OR older.next_attempt_at > NOW())
              )
            ORDER BY e.created_at ASC, e.id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unpublished events")?;

        let events: Vec<OutboxEvent> = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxEvent {
                    id: row.try_get("id")?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    event_type: row.try_get("event_type")?,
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    metadata: row.try_get("metadata")?,
                    created_at: row.try_get("created_at")?,
                    published_at: row.try_get("published_at")?,
                    retry_count: row.try_get("retry_count")?,
                    last_error: row.try_get("last_error")?,
                    next_attempt_at: row.try_get("next_attempt_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("Failed to parse events")?;

        debug!(count = events.len(), "Fetched unpublished events");

        Ok(events)
    }

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET published_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as published")?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking as published");
            return Err(OutboxError::EventNotFound(event_id));
        }

        debug!(event_id = %event_id, "Event marked as published");

        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET
                retry_count = retry_count + 1,
                last_error = $2,
                next_attempt_at = $3
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as failed")?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking as failed");
            return Err(OutboxError::EventNotFound(event_id));
        }

        warn!(
            event_id = %event_id,
            error = %error,
            retry_at = %retry_at,
            "Event marked as failed"
        );

        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        SqlxOutboxRepository::pending_stats(self).await
    }
}

/// Publisher trait for publishing events to external systems (e.g., Kafka).
///
/// Implementations should be idempotent to handle retries safely.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    /// Publish an event to its topic. Returns only once delivery is confirmed.
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Kafka-based implementation of OutboxPublisher.
///
/// This publisher:
/// - Reuses one long-lived producer for the whole process
/// - Sends to the topic recorded on the event
/// - Includes event metadata in Kafka headers
/// - Uses aggregate_id as partition key for per-product ordering
/// - Waits for the broker acknowledgement (bounded by `delivery_timeout`)
pub struct KafkaOutboxPublisher {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaOutboxPublisher {
    /// Create a new Kafka publisher.
    ///
    /// # Kafka Configuration Requirements
    ///
    /// The producer MUST be configured with:
    /// - `enable.idempotence = true` (prevents duplicates on internal retries)
    /// - `acks = all` (ensures durability)
    pub fn new(producer: FutureProducer, delivery_timeout: Duration) -> Self {
        Self {
            producer,
            delivery_timeout,
        }
    }

    fn headers(event: &OutboxEvent) -> OwnedHeaders {
        let event_id_str = event.id.to_string();
        let aggregate_id_str = event.aggregate_id.to_string();
        let created_at_str = event.created_at.to_rfc3339();

        let mut headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_type",
                value: Some(event.event_type.as_bytes()),
            })
            .insert(Header {
                key: "event_id",
                value: Some(event_id_str.as_bytes()),
            })
            .insert(Header {
                key: "aggregate_type",
                value: Some(event.aggregate_type.as_bytes()),
            })
            .insert(Header {
                key: "aggregate_id",
                value: Some(aggregate_id_str.as_bytes()),
            })
            .insert(Header {
                key: "created_at",
                value: Some(created_at_str.as_bytes()),
            });

        if let Some(cid_str) = event
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("correlation_id"))
            .and_then(|correlation_id| correlation_id.as_str())
        {
            headers = headers.insert(Header {
                key: "correlation_id",
                value: Some(cid_str.as_bytes()),
            });
        }

        headers
    }
}

#[async_trait]
impl OutboxPublisher for KafkaOutboxPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let payload_str =
            serde_json::to_string(&event.payload).context("Failed to serialize event payload")?;
        let key = event.aggregate_id.to_string();

        let record = FutureRecord::to(&event.topic)
            .key(&key)
            .payload(&payload_str)
            .headers(Self::headers(event));

        let (partition, offset) = self
            .producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| {
                OutboxError::PublishFailed(format!("Kafka publish failed: {}", err))
            })?;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            topic = %event.topic,
            partition,
            offset,
            "Event published to Kafka"
        );

        Ok(())
    }
}

/// Background processor for publishing outbox events.
///
/// # Processing Guarantees
///
/// - **At-least-once delivery**: Events may be published multiple times if crashes occur
/// - **Ordering per aggregate**: An event is never published before an older pending
///   event of the same aggregate_id; a failing event holds back the ones behind it
/// - **Automatic retries**: Failed events are retried up to max_retries times, each
///   retry scheduled through `next_attempt_at` so other aggregates keep flowing
/// - **Dead letter handling**: Events exceeding max_retries are no longer selected and
///   block their aggregate until replayed
pub struct OutboxProcessor<R: OutboxRepository, P: OutboxPublisher> {
    repository: Arc<R>,
    publisher: Arc<P>,
    batch_size: i32,
    poll_interval: Duration,
    max_retries: i32,
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxProcessor<R, P> {
    pub fn new(
        repository: Arc<R>,
        publisher: Arc<P>,
        batch_size: i32,
        poll_interval: Duration,
        max_retries: i32,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_interval,
            max_retries,
            metrics: None,
        }
    }

    /// Update Prometheus metrics each polling cycle.
    pub fn with_metrics(mut self, metrics: crate::metrics::OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the processor loop until the shutdown flag flips to `true`.
    ///
    /// Errors inside a cycle are logged; the loop only ends on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            batch_size = self.batch_size,
            poll_interval_secs = self.poll_interval.as_secs(),
            max_retries = self.max_retries,
            "Outbox processor starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_batch(&shutdown).await {
                Ok(count) => {
                    if count > 0 {
                        info!(published_count = count, "Published events from outbox");
                    } else {
                        debug!("No events to publish");
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Outbox processor error");
                }
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Outbox processor stopped");
        Ok(())
    }

    /// Process a single batch of events.
    ///
    /// Returns the number of successfully published events. Stops between
    /// events once shutdown was requested.
    async fn process_batch(&self, shutdown: &watch::Receiver<bool>) -> OutboxResult<i32> {
        let events = self
            .repository
            .get_unpublished(self.batch_size, self.max_retries)
            .await?;
        let mut published_count = 0;
        let mut held_back: HashSet<(String, i64)> = HashSet::new();

        for event in events {
            if *shutdown.borrow() {
                debug!("Shutdown requested, leaving rest of batch for the next run");
                break;
            }

            let aggregate = (event.aggregate_type.clone(), event.aggregate_id);
            if held_back.contains(&aggregate) {
                debug!(
                    event_id = %event.id,
                    aggregate_id = event.aggregate_id,
                    "Older event of this aggregate failed, holding back"
                );
                continue;
            }

            match self.publisher.publish(&event).await {
                Ok(_) => {
                    if let Err(e) = self.repository.mark_published(event.id).await {
                        // Delivered but not marked: the event will be sent again,
                        // consumers upsert by product id
                        error!(
                            event_id = %event.id,
                            error = ?e,
                            "Failed to mark event as published (event was delivered to Kafka)"
                        );
                        held_back.insert(aggregate);
                    } else {
                        published_count += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                }
                Err(e) => {
                    held_back.insert(aggregate);

                    let retry_count = event.retry_count.saturating_add(1);
                    let delay = self.calculate_backoff(retry_count);
                    let retry_at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
                    if retry_count >= self.max_retries {
                        warn!(
                            event_id = %event.id,
                            event_type = %event.event_type,
                            aggregate_id = event.aggregate_id,
                            max_retries = self.max_retries,
                            "Event exhausted its retries (requires manual replay)"
                        );
                    }
                    error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        retry_count,
                        backoff_secs = delay.as_secs(),
                        error = ?e,
                        "Failed to publish event"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.publish_failures.inc();
                    }

                    if let Err(mark_err) = self
                        .repository
                        .mark_failed(event.id, &e.to_string(), retry_at)
                        .await
                    {
                        error!(
                            event_id = %event.id,
                            error = ?mark_err,
                            "Failed to mark event as failed"
                        );
                    }
                }
            }
        }

        Ok(published_count)
    }

    /// Calculate exponential backoff delay based on retry count.
    ///
    /// First attempts go out immediately; retry n is due 2^(n-1) seconds
    /// after the previous failure, capped at 5 minutes.
    fn calculate_backoff(&self, retry_count: i32) -> Duration {
        const MAX_BACKOFF_SECS: u64 = 300;

        if retry_count <= 0 {
            return Duration::ZERO;
        }

        let exponent = (retry_count - 1).min(16) as u32;
        Duration::from_secs(2u64.pow(exponent).min(MAX_BACKOFF_SECS))
    }
}
