//! Merge step of the product events consumer.
//!
//! Decides what happens to one inbound message: apply it to the store, skip
//! it as already applied, or hand it to the dead-letter topic. Knows nothing
//! about Kafka so it can be driven directly in tests.

use chrono::Utc;
use offset_watermark::{OffsetWatermark, ProcessingResult};
use resilience::{with_retry, with_timeout_result, RetryConfig, RetryError, TimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::{Product, ProductEvent, UpsertOutcome};
use crate::error::{ServiceError, ServiceResult};
use crate::metrics::MergeMetrics;
use crate::repository::ProductStore;

/// Broker-independent view of a delivered message
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// What the consumer loop must do with a message before committing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Applied(UpsertOutcome),
    /// Offset below the partition watermark
    Skipped { watermark: i64 },
    /// Send to the dead-letter topic, then commit
    DeadLetter { reason: String },
}

pub struct MergeHandler {
    store: Arc<dyn ProductStore>,
    watermark: Arc<OffsetWatermark>,
    retry: RetryConfig,
    apply_timeout: Duration,
    metrics: MergeMetrics,
}

impl MergeHandler {
    pub fn new(
        store: Arc<dyn ProductStore>,
        watermark: Arc<OffsetWatermark>,
        retry: RetryConfig,
        apply_timeout: Duration,
        metrics: MergeMetrics,
    ) -> Self {
        Self {
            store,
            watermark,
            retry,
            apply_timeout,
            metrics,
        }
    }

    pub fn watermark(&self) -> &OffsetWatermark {
        &self.watermark
    }

    pub async fn handle(&self, message: &InboundMessage) -> MergeDecision {
        let event = match message
            .payload
            .as_deref()
            .ok_or_else(|| ServiceError::Decode("empty payload".to_string()))
            .and_then(ProductEvent::decode)
        {
            Ok(event) => event,
            Err(e) => {
                self.metrics.decode_failures.inc();
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Failed to decode product message"
                );
                return MergeDecision::DeadLetter {
                    reason: e.to_string(),
                };
            }
        };

        let product = event.into_product(Utc::now());
        let result = self
            .watermark
            .process_if_new(&message.topic, message.partition, message.offset, || {
                self.apply(&product)
            })
            .await;

        match result {
            Ok(ProcessingResult::Success(outcome)) => {
                self.metrics
                    .applied
                    .with_label_values(&[outcome.as_str()])
                    .inc();
                info!(
                    product_id = product.id,
                    partition = message.partition,
                    offset = message.offset,
                    outcome = outcome.as_str(),
                    "Product message applied"
                );
                MergeDecision::Applied(outcome)
            }
            Ok(ProcessingResult::AlreadyProcessed { watermark }) => {
                self.metrics.skipped.inc();
                debug!(
                    product_id = product.id,
                    partition = message.partition,
                    offset = message.offset,
                    watermark,
                    "Product message already applied"
                );
                MergeDecision::Skipped { watermark }
            }
            Ok(ProcessingResult::Failed(e)) => {
                warn!(
                    product_id = product.id,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Giving up on product message"
                );
                MergeDecision::DeadLetter {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                warn!(error = %e, "Message rejected by watermark guard");
                MergeDecision::DeadLetter {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Upsert bounded by the apply timeout, retried with exponential backoff
    async fn apply(&self, product: &Product) -> ServiceResult<UpsertOutcome> {
        let store = self.store.as_ref();
        let timeout = self.apply_timeout;

        with_retry(self.retry.clone(), move || async move {
            with_timeout_result(timeout, store.upsert(product))
                .await
                .map_err(|e| match e {
                    TimeoutError::Elapsed(after) => ServiceError::Timeout(after),
                    TimeoutError::Failed(inner) => inner,
                })
        })
        .await
        .map_err(RetryError::into_inner)
    }
}
