/// Resilience patterns for the catalog sync pipeline
///
/// This library provides the failure-handling building blocks shared by the
/// product service and its background workers:
/// - **Timeout**: Enforces time limits on store writes and broker calls
/// - **Retry**: Exponential backoff with jitter for transient failures
/// - **Backoff**: Stateful exponential delay for long-running loops
/// - **Preset Configurations**: Pre-tuned settings for store applies and broker reconnects
///
/// # Example: Store write with timeout and retry
///
/// ```rust,no_run
/// use resilience::{presets, retry::with_retry, timeout::with_timeout_result};
///
/// #[tokio::main]
/// async fn main() {
///     let config = presets::store_apply_config();
///     let timeout = config.timeout.duration;
///
///     let result = with_retry(config.retry.unwrap_or_default(), || async move {
///         with_timeout_result(timeout, async {
///             // Your upsert here
///             Ok::<_, String>(())
///         })
///         .await
///     })
///     .await;
/// }
/// ```

pub mod backoff;
pub mod presets;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use backoff::ExponentialBackoff;
pub use presets::{broker_reconnect_config, store_apply_config, ServiceConfig};
pub use retry::{with_retry, RetryConfig, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutConfig, TimeoutError};
