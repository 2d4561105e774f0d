//! Product event payloads exchanged with the peer catalog service.
//!
//! The JSON body is a plain product snapshot. The event kind travels in the
//! `event_type` Kafka header so the payload shape stays identical in both
//! directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::Product;
use crate::error::{ServiceError, ServiceResult};

pub const AGGREGATE_TYPE: &str = "product";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductEventKind {
    Created,
    Updated,
}

impl ProductEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductEventKind::Created => "product.created",
            ProductEventKind::Updated => "product.updated",
        }
    }
}

/// Request to record an outbox event alongside a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIntent {
    pub kind: ProductEventKind,
    pub topic: String,
}

impl EventIntent {
    pub fn new(kind: ProductEventKind, topic: impl Into<String>) -> Self {
        Self {
            kind,
            topic: topic.into(),
        }
    }

    /// Build the outbox row announcing `product`
    pub fn to_outbox_event(
        &self,
        product: &Product,
    ) -> ServiceResult<transactional_outbox::OutboxEvent> {
        let payload = serde_json::to_value(ProductEvent::from(product))?;
        Ok(transactional_outbox::OutboxEvent::new(
            AGGREGATE_TYPE,
            product.id,
            self.kind.as_str(),
            self.topic.clone(),
            payload,
        ))
    }
}

/// Product snapshot as carried on the wire.
///
/// Missing text fields decode as empty strings and missing numbers as zero.
/// `id` is mandatory; negative price or stock is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductEvent {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProductEvent {
    pub fn decode(payload: &[u8]) -> ServiceResult<Self> {
        if payload.is_empty() {
            return Err(ServiceError::Decode("empty payload".to_string()));
        }
        let event: ProductEvent = serde_json::from_slice(payload)?;
        if event.id <= 0 {
            return Err(ServiceError::Decode(format!(
                "product id must be positive, got {}",
                event.id
            )));
        }
        if !event.price.is_finite() || event.price < 0.0 {
            return Err(ServiceError::Decode(format!(
                "product {} has invalid price {}",
                event.id, event.price
            )));
        }
        if event.stock < 0 {
            return Err(ServiceError::Decode(format!(
                "product {} has negative stock {}",
                event.id, event.stock
            )));
        }
        Ok(event)
    }

    /// Record to upsert. Missing timestamps fall back to `now`, and
    /// `updated_at` is clamped so it never precedes `created_at`.
    pub fn into_product(self, now: DateTime<Utc>) -> Product {
        let created_at = self.created_at.unwrap_or(now);
        let updated_at = self.updated_at.unwrap_or(created_at).max(created_at);
        Product {
            id: self.id,
            name: self.name,
            brand: self.brand,
            price: self.price,
            description: self.description,
            stock: self.stock,
            created_at,
            updated_at,
        }
    }
}

impl From<&Product> for ProductEvent {
    fn from(product: &Product) -> Self {
        Self {
            id: product.id,
            name: product.name.clone(),
            brand: product.brand.clone(),
            price: product.price,
            description: product.description.clone(),
            stock: product.stock,
            created_at: Some(product.created_at),
            updated_at: Some(product.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_defaults_missing_fields() {
        let event = ProductEvent::decode(br#"{"id": 4, "name": "Gadget"}"#).unwrap();

        assert_eq!(event.id, 4);
        assert_eq!(event.name, "Gadget");
        assert_eq!(event.brand, "");
        assert_eq!(event.price, 0.0);
        assert_eq!(event.stock, 0);
        assert!(event.created_at.is_none());
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(ProductEvent::decode(b"").is_err());
        assert!(ProductEvent::decode(b"not json").is_err());
        assert!(ProductEvent::decode(br#"{"name": "no id"}"#).is_err());
        assert!(ProductEvent::decode(br#"{"id": 0}"#).is_err());
        assert!(ProductEvent::decode(br#"{"id": 1, "stock": -3}"#).is_err());
        assert!(ProductEvent::decode(br#"{"id": 1, "price": -0.5}"#).is_err());
    }

    #[test]
    fn test_decode_rfc3339_timestamps() {
        let event = ProductEvent::decode(
            br#"{"id": 1, "created_at": "2024-03-01T10:00:00.000Z", "updated_at": "2024-03-02T10:00:00Z"}"#,
        )
        .unwrap();

        let product = event.into_product(Utc::now());
        assert_eq!(product.created_at.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert_eq!(product.updated_at.to_rfc3339(), "2024-03-02T10:00:00+00:00");
    }

    #[test]
    fn test_missing_timestamps_use_now() {
        let now = Utc::now();
        let product = ProductEvent::decode(br#"{"id": 2}"#)
            .unwrap()
            .into_product(now);

        assert_eq!(product.created_at, now);
        assert_eq!(product.updated_at, now);
    }

    #[test]
    fn test_payload_has_no_event_type() {
        let now = Utc::now();
        let product = ProductEvent::decode(br#"{"id": 5, "name": "Widget"}"#)
            .unwrap()
            .into_product(now);

        let intent = EventIntent::new(ProductEventKind::Created, "go-to-rails");
        let event = intent.to_outbox_event(&product).unwrap();

        assert_eq!(event.event_type, "product.created");
        assert_eq!(event.aggregate_id, 5);
        assert_eq!(event.topic, "go-to-rails");
        let fields = event.payload.as_object().unwrap();
        assert!(!fields.contains_key("event_type"));
        assert_eq!(fields["name"], "Widget");
    }
}
