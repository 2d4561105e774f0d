use actix_web::{HttpResponse, Responder};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

/// Handler that serialises Prometheus metrics in text format.
pub async fn metrics_handler() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Counters for the merge worker
#[derive(Clone)]
pub struct MergeMetrics {
    /// Upserts by outcome (inserted / updated / stale)
    pub applied: IntCounterVec,
    /// Messages below the partition watermark
    pub skipped: IntCounter,
    pub dead_lettered: IntCounter,
    pub decode_failures: IntCounter,
}

impl MergeMetrics {
    pub fn new() -> Self {
        Self::with_registry(prometheus::default_registry())
    }

    pub fn with_registry(registry: &Registry) -> Self {
        let applied = IntCounterVec::new(
            Opts::new(
                "product_merge_applied_total",
                "Inbound product messages applied to the store, by outcome",
            ),
            &["outcome"],
        )
        .expect("valid metric opts for product_merge_applied_total");

        let skipped = IntCounter::new(
            "product_merge_skipped_total",
            "Inbound product messages skipped as already applied",
        )
        .expect("valid metric opts for product_merge_skipped_total");

        let dead_lettered = IntCounter::new(
            "product_merge_dead_lettered_total",
            "Inbound product messages routed to the dead-letter topic",
        )
        .expect("valid metric opts for product_merge_dead_lettered_total");

        let decode_failures = IntCounter::new(
            "product_merge_decode_failures_total",
            "Inbound product messages that could not be decoded",
        )
        .expect("valid metric opts for product_merge_decode_failures_total");

        for metric in [
            Box::new(applied.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(skipped.clone()),
            Box::new(dead_lettered.clone()),
            Box::new(decode_failures.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register merge worker metric: {}", e);
            }
        }

        Self {
            applied,
            skipped,
            dead_lettered,
            decode_failures,
        }
    }
}

impl Default for MergeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_metrics_register_once_per_registry() {
        let registry = Registry::new();
        let metrics = MergeMetrics::with_registry(&registry);
        metrics.applied.with_label_values(&["inserted"]).inc();
        metrics.skipped.inc();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"product_merge_applied_total".to_string()));
        assert!(names.contains(&"product_merge_skipped_total".to_string()));

        // Registering again only logs a warning
        let _ = MergeMetrics::with_registry(&registry);
    }
}
