//! Dead-letter publishing for inbound product messages
//!
//! Messages that cannot be decoded, or whose apply kept failing after all
//! retries, are copied to the dead-letter topic with their failure context
//! so they can be inspected and replayed by hand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use super::merge::InboundMessage;
use crate::error::{ServiceError, ServiceResult};

/// Dead-letter message format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterRecord {
    pub source_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub error: String,
    /// Original payload; lossy UTF-8 when the bytes were not valid text
    pub payload: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(message: &InboundMessage, error: impl Into<String>) -> Self {
        Self {
            source_topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            error: error.into(),
            payload: message
                .payload
                .as_deref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
            failed_at: Utc::now(),
        }
    }

    /// Partition key, keeps failures of one source partition ordered
    pub fn key(&self) -> String {
        format!("{}-{}", self.source_topic, self.partition)
    }
}

/// Destination for messages the merge worker gives up on
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Returns once the record is durably stored
    async fn send(&self, record: &DeadLetterRecord) -> ServiceResult<()>;
}

pub struct DeadLetterProducer {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl DeadLetterProducer {
    pub fn new(producer: FutureProducer, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            producer,
            topic: topic.into(),
            timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

}

#[async_trait]
impl DeadLetterSink for DeadLetterProducer {
    /// Send and wait for the broker acknowledgement
    async fn send(&self, record: &DeadLetterRecord) -> ServiceResult<()> {
        let payload = serde_json::to_string(record)
            .map_err(|e| ServiceError::Publish(format!("Failed to serialize DLQ record: {}", e)))?;
        let key = record.key();

        let delivery = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(delivery, self.timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %self.topic,
                    partition,
                    offset,
                    source_offset = record.offset,
                    "Sent product message to DLQ"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(
                    error = %e,
                    source_topic = %record.source_topic,
                    source_partition = record.partition,
                    source_offset = record.offset,
                    "Failed to send product message to DLQ"
                );
                Err(ServiceError::Publish(format!("Kafka send error: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: Option<&[u8]>) -> InboundMessage {
        InboundMessage {
            topic: "rails-to-go".to_string(),
            partition: 2,
            offset: 17,
            payload: payload.map(|p| p.to_vec()),
        }
    }

    #[test]
    fn test_record_carries_failure_context() {
        let record = DeadLetterRecord::new(&message(Some(b"{\"id\": 0}")), "id must be positive");

        assert_eq!(record.source_topic, "rails-to-go");
        assert_eq!(record.partition, 2);
        assert_eq!(record.offset, 17);
        assert_eq!(record.error, "id must be positive");
        assert_eq!(record.payload.as_deref(), Some("{\"id\": 0}"));
        assert_eq!(record.key(), "rails-to-go-2");
    }

    #[test]
    fn test_record_json_shape() {
        let record = DeadLetterRecord::new(&message(None), "empty payload");
        let json = serde_json::to_value(&record).unwrap();

        for field in ["source_topic", "partition", "offset", "error", "payload", "failed_at"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert!(json["payload"].is_null());
    }

    #[test]
    fn test_binary_payload_is_kept_lossy() {
        let record = DeadLetterRecord::new(&message(Some(&[0xff, b'{'])), "invalid JSON");
        assert_eq!(record.payload.as_deref(), Some("\u{fffd}{"));
    }
}
