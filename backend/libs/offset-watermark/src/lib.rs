//! # Offset Watermark Library
//!
//! Suppresses re-application of redelivered Kafka messages inside a single
//! consumer process. For every `(topic, partition)` it remembers the highest
//! offset whose message was successfully applied.
//!
//! ## Semantics
//!
//! - A partition starts with no watermark (the lowest possible value), so the
//!   first message of any partition is always accepted.
//! - A message whose offset is **greater than or equal to** the watermark is
//!   applied; on success the watermark advances to that offset.
//! - A message whose offset is **below** the watermark is reported as
//!   `AlreadyProcessed` and the apply function is not called.
//! - A failed apply leaves the watermark untouched so the message can be
//!   retried or redelivered.
//!
//! Re-applying the watermark offset itself is allowed, so the apply function
//! must be idempotent (e.g. an upsert keyed by the record identifier).
//!
//! ## Concurrency
//!
//! Each partition has its own async mutex, held across the whole
//! read-compare-apply-advance sequence. Messages of one partition are
//! therefore applied strictly one at a time while different partitions
//! proceed in parallel.
//!
//! ```text
//! Kafka (partition N) → Consumer → OffsetWatermark[N] → apply() → Store
//!                                   (lock held across apply)
//! ```
//!
//! ## Durability
//!
//! Watermarks live in memory only and are lost on restart. Durable progress
//! is the consumer group's committed offset; the watermark only covers
//! redeliveries that happen while the process is alive (rebalances, retried
//! fetches).
//!
//! ## Usage Example
//!
//! ```ignore
//! use offset_watermark::{OffsetWatermark, ProcessingResult};
//!
//! # async fn example(watermark: &OffsetWatermark) -> Result<(), Box<dyn std::error::Error>> {
//! match watermark
//!     .process_if_new("rails-to-go", 0, 42, || async {
//!         upsert_product().await
//!     })
//!     .await?
//! {
//!     ProcessingResult::Success(_) => println!("applied"),
//!     ProcessingResult::AlreadyProcessed { watermark } => println!("skipped, at {}", watermark),
//!     ProcessingResult::Failed(e) => eprintln!("apply failed: {}", e),
//! }
//! # Ok(())
//! # }
//! ```

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod error;

pub use error::{WatermarkError, WatermarkResult};

/// Result of processing a message under the watermark guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult<T, E> {
    /// Message was applied and the watermark advanced to its offset
    Success(T),

    /// Offset is below the partition watermark; apply was not attempted
    AlreadyProcessed { watermark: i64 },

    /// Apply function returned an error; watermark unchanged
    Failed(E),
}

impl<T, E> ProcessingResult<T, E> {
    /// Applied now or earlier; the message may be acknowledged
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            ProcessingResult::Success(_) | ProcessingResult::AlreadyProcessed { .. }
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ProcessingResult::Failed(_))
    }
}

/// Identifies one partition of one topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// Per-partition highest-applied-offset tracker
///
/// Cheap to share: wrap in `Arc` and hand a clone to every consumer task.
#[derive(Debug, Default)]
pub struct OffsetWatermark {
    partitions: DashMap<PartitionKey, Arc<Mutex<Option<i64>>>>,
}

impl OffsetWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current watermark of a partition, `None` if nothing was applied yet
    pub async fn current(&self, topic: &str, partition: i32) -> Option<i64> {
        let slot = self.partitions.get(&PartitionKey::new(topic, partition))?.clone();
        let guard = slot.lock().await;
        *guard
    }

    /// Process a message only if its offset is not below the partition watermark
    ///
    /// The partition lock is held for the whole call, including `f`, so the
    /// comparison, the apply and the advance form one critical section.
    ///
    /// # Errors
    ///
    /// Returns `WatermarkError` for an empty topic or a negative offset. Apply
    /// failures are not errors of this call; they come back as
    /// `ProcessingResult::Failed`.
    pub async fn process_if_new<F, Fut, T, E>(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        f: F,
    ) -> WatermarkResult<ProcessingResult<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        Self::validate(topic, partition, offset)?;

        let slot = self.slot(topic, partition);
        let mut watermark = slot.lock().await;

        if let Some(current) = *watermark {
            if offset < current {
                debug!(
                    topic = %topic,
                    partition,
                    offset,
                    watermark = current,
                    "Offset below watermark, skipping"
                );
                return Ok(ProcessingResult::AlreadyProcessed { watermark: current });
            }
        }

        match f().await {
            Ok(value) => {
                *watermark = Some(offset);
                debug!(topic = %topic, partition, offset, "Watermark advanced");
                Ok(ProcessingResult::Success(value))
            }
            Err(e) => Ok(ProcessingResult::Failed(e)),
        }
    }

    /// Forget a partition, e.g. after its assignment was revoked
    pub fn reset_partition(&self, topic: &str, partition: i32) {
        if self
            .partitions
            .remove(&PartitionKey::new(topic, partition))
            .is_some()
        {
            info!(topic = %topic, partition, "Partition watermark reset");
        }
    }

    /// Point-in-time copy of every known watermark, sorted by partition
    pub async fn snapshot(&self) -> Vec<(PartitionKey, i64)> {
        let slots: Vec<(PartitionKey, Arc<Mutex<Option<i64>>>)> = self
            .partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut out = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            if let Some(offset) = *slot.lock().await {
                out.push((key, offset));
            }
        }
        out.sort();
        out
    }

    fn slot(&self, topic: &str, partition: i32) -> Arc<Mutex<Option<i64>>> {
        // Clone the Arc out so the DashMap shard lock is released before awaiting
        self.partitions
            .entry(PartitionKey::new(topic, partition))
            .or_default()
            .clone()
    }

    fn validate(topic: &str, partition: i32, offset: i64) -> WatermarkResult<()> {
        if topic.is_empty() {
            return Err(WatermarkError::InvalidTopic(
                "Topic cannot be empty".to_string(),
            ));
        }

        if offset < 0 {
            return Err(WatermarkError::InvalidOffset {
                topic: topic.to_string(),
                partition,
                offset,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn apply(
        watermark: &OffsetWatermark,
        partition: i32,
        offset: i64,
    ) -> ProcessingResult<i64, String> {
        watermark
            .process_if_new("rails-to-go", partition, offset, || async move {
                Ok::<_, String>(offset)
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_validate() {
        assert!(OffsetWatermark::validate("t", 0, 0).is_ok());

        let err = OffsetWatermark::validate("", 0, 1).unwrap_err();
        assert!(matches!(err, WatermarkError::InvalidTopic(_)));

        let err = OffsetWatermark::validate("t", 3, -1).unwrap_err();
        assert_eq!(
            err,
            WatermarkError::InvalidOffset {
                topic: "t".to_string(),
                partition: 3,
                offset: -1
            }
        );
    }

    #[test]
    fn test_processing_result() {
        assert!(ProcessingResult::<(), String>::Success(()).is_ok());
        assert!(ProcessingResult::<(), String>::AlreadyProcessed { watermark: 3 }.is_ok());
        assert!(!ProcessingResult::<(), String>::Failed("error".to_string()).is_ok());
        assert!(ProcessingResult::<(), String>::Failed("error".to_string()).is_failed());
    }

    #[tokio::test]
    async fn test_first_message_of_partition_is_accepted() {
        let watermark = OffsetWatermark::new();
        assert_eq!(watermark.current("rails-to-go", 0).await, None);

        assert_eq!(apply(&watermark, 0, 0).await, ProcessingResult::Success(0));
        assert_eq!(watermark.current("rails-to-go", 0).await, Some(0));
    }

    #[tokio::test]
    async fn test_out_of_order_offsets_are_skipped() {
        let watermark = OffsetWatermark::new();

        assert_eq!(apply(&watermark, 0, 5).await, ProcessingResult::Success(5));
        assert_eq!(
            apply(&watermark, 0, 3).await,
            ProcessingResult::AlreadyProcessed { watermark: 5 }
        );
        assert_eq!(apply(&watermark, 0, 7).await, ProcessingResult::Success(7));
        assert_eq!(watermark.current("rails-to-go", 0).await, Some(7));
    }

    #[tokio::test]
    async fn test_watermark_offset_itself_is_reapplied() {
        let watermark = OffsetWatermark::new();

        apply(&watermark, 0, 5).await;
        assert_eq!(apply(&watermark, 0, 5).await, ProcessingResult::Success(5));
    }

    #[tokio::test]
    async fn test_failed_apply_does_not_advance() {
        let watermark = OffsetWatermark::new();
        apply(&watermark, 0, 2).await;

        let result = watermark
            .process_if_new("rails-to-go", 0, 9, || async {
                Err::<(), _>("store unavailable".to_string())
            })
            .await
            .unwrap();

        assert!(result.is_failed());
        assert_eq!(watermark.current("rails-to-go", 0).await, Some(2));
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let watermark = OffsetWatermark::new();

        apply(&watermark, 0, 100).await;
        assert_eq!(apply(&watermark, 1, 4).await, ProcessingResult::Success(4));

        assert_eq!(watermark.current("rails-to-go", 0).await, Some(100));
        assert_eq!(watermark.current("rails-to-go", 1).await, Some(4));
    }

    #[tokio::test]
    async fn test_reset_partition_and_snapshot() {
        let watermark = OffsetWatermark::new();
        apply(&watermark, 1, 8).await;
        apply(&watermark, 0, 3).await;

        assert_eq!(
            watermark.snapshot().await,
            vec![
                (PartitionKey::new("rails-to-go", 0), 3),
                (PartitionKey::new("rails-to-go", 1), 8),
            ]
        );

        watermark.reset_partition("rails-to-go", 1);
        assert_eq!(watermark.current("rails-to-go", 1).await, None);
        assert_eq!(apply(&watermark, 1, 2).await, ProcessingResult::Success(2));
    }
}
