use prometheus::{IntCounter, IntGauge, Opts, Registry};
use tracing::warn;

#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub published: IntCounter,
    pub publish_failures: IntCounter,
}

impl OutboxMetrics {
    /// Register against the process-wide default registry.
    pub fn new(service: &str) -> Self {
        Self::with_registry(prometheus::default_registry(), service)
    }

    pub fn with_registry(registry: &Registry, service: &str) -> Self {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("service", service.to_string())
        };

        let pending = IntGauge::with_opts(opts(
            "outbox_pending_count",
            "Number of unpublished outbox events currently pending",
        ))
        .expect("valid metric opts for outbox_pending_count");

        let oldest_pending_age_seconds = IntGauge::with_opts(opts(
            "outbox_oldest_pending_age_seconds",
            "Age in seconds of the oldest pending outbox event",
        ))
        .expect("valid metric opts for outbox_oldest_pending_age_seconds");

        let published = IntCounter::with_opts(opts(
            "outbox_published_total",
            "Total number of outbox events acknowledged by the broker",
        ))
        .expect("valid metric opts for outbox_published_total");

        let publish_failures = IntCounter::with_opts(opts(
            "outbox_publish_failures_total",
            "Total number of failed outbox publish attempts",
        ))
        .expect("valid metric opts for outbox_publish_failures_total");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(published.clone()),
            Box::new(publish_failures.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            published,
            publish_failures,
        }
    }
}
