//! Error types for offset watermark library

use thiserror::Error;

/// Result type for watermark operations
pub type WatermarkResult<T> = Result<T, WatermarkError>;

/// Errors raised before a message reaches the critical section
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatermarkError {
    /// Topic name was empty
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Broker offsets are never negative; a negative value means a logical
    /// offset sentinel leaked into the handler
    #[error("Invalid offset {offset} for {topic}[{partition}]")]
    InvalidOffset {
        topic: String,
        partition: i32,
        offset: i64,
    },
}
