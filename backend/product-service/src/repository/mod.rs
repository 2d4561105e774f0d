pub mod products;

pub use products::{PgProductRepository, ProductStore};
