//! Product Events Consumer
//!
//! Consumes product snapshots published by the peer catalog service and
//! merges them into the local store. Offsets are committed manually, only
//! after a message was applied, skipped as already applied, or copied to the
//! dead-letter topic.

use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::Offset;
use resilience::{ExponentialBackoff, RetryConfig};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetterProducer, DeadLetterRecord, DeadLetterSink};
use super::merge::{InboundMessage, MergeDecision, MergeHandler};
use crate::config::KafkaConfig;
use crate::error::ServiceResult;
use crate::metrics::MergeMetrics;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of the consumer, published on a watch channel for `/ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Consuming,
    RecoverableError,
    ShuttingDown,
    Stopped,
}

impl WorkerState {
    pub fn is_ready(self) -> bool {
        matches!(self, WorkerState::Consuming)
    }
}

/// What happens to a message's broker offset once it was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAction {
    /// Applied, already applied, or copied to the dead-letter topic
    Commit,
    /// Neither applied nor dead-lettered; deliver it again
    Rewind,
}

/// Route a merge decision and decide whether its offset may be committed.
///
/// A dead-letter decision only commits once the sink accepted the record.
pub async fn settle<S: DeadLetterSink + ?Sized>(
    decision: MergeDecision,
    message: &InboundMessage,
    dead_letters: &S,
    metrics: &MergeMetrics,
) -> OffsetAction {
    let reason = match decision {
        MergeDecision::Applied(_) | MergeDecision::Skipped { .. } => return OffsetAction::Commit,
        MergeDecision::DeadLetter { reason } => reason,
    };

    let record = DeadLetterRecord::new(message, reason);
    match dead_letters.send(&record).await {
        Ok(()) => {
            metrics.dead_lettered.inc();
            OffsetAction::Commit
        }
        Err(e) => {
            error!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Dead-lettering failed, message left uncommitted"
            );
            OffsetAction::Rewind
        }
    }
}

pub struct ProductEventsConsumer {
    consumer: StreamConsumer,
    topic: String,
    handler: MergeHandler,
    dead_letters: DeadLetterProducer,
    metrics: MergeMetrics,
    reconnect: RetryConfig,
    state: watch::Sender<WorkerState>,
}

impl ProductEventsConsumer {
    /// Join the consumer group and subscribe to the inbound topic
    pub fn new(
        config: &KafkaConfig,
        handler: MergeHandler,
        dead_letters: DeadLetterProducer,
        metrics: MergeMetrics,
        reconnect: RetryConfig,
        state: watch::Sender<WorkerState>,
    ) -> ServiceResult<Self> {
        state.send_replace(WorkerState::Starting);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000")
            .create()?;

        consumer.subscribe(&[&config.inbound_topic])?;

        info!(
            brokers = %config.brokers,
            topic = %config.inbound_topic,
            group_id = %config.group_id,
            dlq_topic = %dead_letters.topic(),
            "Product events consumer initialized"
        );

        Ok(Self {
            consumer,
            topic: config.inbound_topic.clone(),
            handler,
            dead_letters,
            metrics,
            reconnect,
            state,
        })
    }

    /// Run the consumer loop until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ServiceResult<()> {
        info!(topic = %self.topic, "Starting product events consumer loop");

        let mut backoff = ExponentialBackoff::new(self.reconnect.clone());
        let mut message_stream = self.consumer.stream();
        self.set_state(WorkerState::Consuming);

        loop {
            let delay = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping consumer");
                        break;
                    }
                    continue;
                }

                message = message_stream.next() => match message {
                    Some(Ok(msg)) => {
                        if self.process_message(&msg).await {
                            backoff.reset();
                            self.set_state(WorkerState::Consuming);
                            continue;
                        }
                        backoff.next_delay()
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Kafka consumer error");
                        backoff.next_delay()
                    }
                    None => {
                        warn!("Message stream ended unexpectedly");
                        break;
                    }
                }
            };

            self.set_state(WorkerState::RecoverableError);
            warn!(
                failures = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                "Consumer backing off"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received during backoff");
                        break;
                    }
                }
            }
        }

        self.set_state(WorkerState::ShuttingDown);
        drop(message_stream);
        let state = self.state.clone();
        // Dropping the consumer leaves the group
        drop(self);
        state.send_replace(WorkerState::Stopped);

        info!("Product events consumer stopped");
        Ok(())
    }

    /// Returns false when the message could neither be applied nor
    /// dead-lettered; it was rewound and will be delivered again.
    async fn process_message(&self, msg: &BorrowedMessage<'_>) -> bool {
        let inbound = InboundMessage {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            payload: msg.payload().map(|p| p.to_vec()),
        };

        if let Some(event_type) = header_value(msg, "event_type") {
            debug!(
                event_type = %event_type,
                partition = inbound.partition,
                offset = inbound.offset,
                "Received product message"
            );
        }

        let decision = self.handler.handle(&inbound).await;
        if settle(decision, &inbound, &self.dead_letters, &self.metrics).await
            == OffsetAction::Rewind
        {
            self.rewind(&inbound);
            return false;
        }

        if let Err(commit_err) = self.consumer.commit_message(msg, CommitMode::Async) {
            warn!("Failed to commit Kafka offset: {}", commit_err);
        }
        true
    }

    fn rewind(&self, message: &InboundMessage) {
        if let Err(e) = self.consumer.seek(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset),
            SEEK_TIMEOUT,
        ) {
            error!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to rewind partition"
            );
        }
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Consumer state changed");
        }
    }
}

fn header_value<'a>(message: &'a BorrowedMessage<'a>, key: &str) -> Option<&'a str> {
    message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == key)
                .and_then(|header| header.value)
        })
        .and_then(|value| std::str::from_utf8(value).ok())
}
