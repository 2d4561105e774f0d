pub mod dead_letter;
pub mod merge;
pub mod product_events;

pub use dead_letter::{DeadLetterProducer, DeadLetterRecord, DeadLetterSink};
pub use merge::{InboundMessage, MergeDecision, MergeHandler};
pub use product_events::{settle, OffsetAction, ProductEventsConsumer, WorkerState};
