pub mod events;
pub mod models;

pub use events::{EventIntent, ProductEvent, ProductEventKind};
pub use models::{
    ClearableField, CreateProduct, Product, ProductPatch, UpsertOutcome, WriteOrigin,
};
