use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{ServiceError, ServiceResult};

/// Product entity - the record synchronized between catalog services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow, Validate)]
pub struct Product {
    #[validate(range(min = 1, message = "id must be positive"))]
    pub id: i64,
    #[validate(length(min = 1, max = 255, message = "name must be 1-255 characters"))]
    pub name: String,
    #[validate(length(max = 255, message = "brand must be at most 255 characters"))]
    pub brand: String,
    #[validate(range(min = 0.0, message = "price must not be negative"))]
    pub price: f64,
    #[validate(length(max = 4096, message = "description must be at most 4096 characters"))]
    pub description: String,
    #[validate(range(min = 0, message = "stock must not be negative"))]
    pub stock: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Validate every field and the timestamp ordering
    pub fn ensure_valid(&self) -> ServiceResult<()> {
        self.validate()?;
        ensure_finite(self.price)?;
        if self.created_at > self.updated_at {
            return Err(ServiceError::Validation(
                "updated_at must not precede created_at".to_string(),
            ));
        }
        Ok(())
    }
}

/// Request body for creating a product
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateProduct {
    /// Assigned from the current maximum id when absent
    #[validate(range(min = 1, message = "id must be positive"))]
    pub id: Option<i64>,
    #[validate(length(min = 1, max = 255, message = "name must be 1-255 characters"))]
    pub name: String,
    #[serde(default)]
    #[validate(length(max = 255, message = "brand must be at most 255 characters"))]
    pub brand: String,
    #[serde(default)]
    #[validate(length(max = 4096, message = "description must be at most 4096 characters"))]
    pub description: String,
    #[serde(default)]
    #[validate(range(min = 0.0, message = "price must not be negative"))]
    pub price: f64,
    #[serde(default)]
    #[validate(range(min = 0, message = "stock must not be negative"))]
    pub stock: i64,
}

impl CreateProduct {
    pub fn ensure_valid(&self) -> ServiceResult<()> {
        self.validate()?;
        ensure_finite(self.price)
    }

    /// Materialize the stored record once the id is known
    pub fn into_product(self, id: i64, now: DateTime<Utc>) -> Product {
        Product {
            id,
            name: self.name,
            brand: self.brand,
            price: self.price,
            description: self.description,
            stock: self.stock,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields a patch can explicitly reset to their zero value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearableField {
    Brand,
    Description,
    Price,
    Stock,
}

/// Partial update with fill-forward semantics.
///
/// A field that is absent, zero or empty keeps the stored value. Resetting a
/// field to zero or empty takes an explicit entry in `clear`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub price: Option<f64>,
    pub description: Option<String>,
    pub stock: Option<i64>,
    #[serde(default)]
    pub clear: Vec<ClearableField>,
}

impl ProductPatch {
    /// Merge onto the stored record.
    ///
    /// `created_at` is carried over and `updated_at` never moves backwards,
    /// even when the clock reads earlier than the stored value. A field
    /// listed in `clear` ends up zero or empty whatever the patch carries.
    pub fn apply_to(self, stored: &Product, now: DateTime<Utc>) -> Product {
        let mut merged = Product {
            id: stored.id,
            name: fill_forward(self.name, &stored.name),
            brand: fill_forward(self.brand, &stored.brand),
            price: fill_forward(self.price, &stored.price),
            description: fill_forward(self.description, &stored.description),
            stock: fill_forward(self.stock, &stored.stock),
            created_at: stored.created_at,
            updated_at: now.max(stored.updated_at),
        };

        for field in self.clear {
            match field {
                ClearableField::Brand => merged.brand.clear(),
                ClearableField::Description => merged.description.clear(),
                ClearableField::Price => merged.price = 0.0,
                ClearableField::Stock => merged.stock = 0,
            }
        }

        merged
    }

    /// Merge and validate the result
    pub fn merge_into(self, stored: &Product, now: DateTime<Utc>) -> ServiceResult<Product> {
        let merged = self.apply_to(stored, now);
        merged.ensure_valid()?;
        Ok(merged)
    }

    /// True when applying the patch would only advance `updated_at`
    pub fn is_empty(&self) -> bool {
        is_unset(&self.name)
            && is_unset(&self.brand)
            && is_unset(&self.price)
            && is_unset(&self.description)
            && is_unset(&self.stock)
            && self.clear.is_empty()
    }
}

fn fill_forward<T: Clone + Default + PartialEq>(incoming: Option<T>, stored: &T) -> T {
    match incoming {
        Some(value) if value != T::default() => value,
        _ => stored.clone(),
    }
}

fn is_unset<T: Default + PartialEq>(value: &Option<T>) -> bool {
    value.as_ref().map_or(true, |v| *v == T::default())
}

/// Who triggered a write. Only API writes are announced to the peer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Api,
    Internal,
}

impl WriteOrigin {
    pub fn publishes_event(self) -> bool {
        matches!(self, WriteOrigin::Api)
    }
}

/// Result of applying an inbound snapshot to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored record is newer than the snapshot; nothing written
    Stale,
}

impl UpsertOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Stale => "stale",
        }
    }
}

fn ensure_finite(price: f64) -> ServiceResult<()> {
    if price.is_finite() {
        Ok(())
    } else {
        Err(ServiceError::Validation("price must be a finite number".to_string()))
    }
}
