use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::{
    CreateProduct, EventIntent, Product, ProductEventKind, ProductPatch, WriteOrigin,
};
use crate::error::{ServiceError, ServiceResult};
use crate::repository::ProductStore;

/// Write path for products.
///
/// API-originated writes record a product event in the same transaction as
/// the row; internal writes stay local.
#[derive(Clone)]
pub struct ProductService {
    store: Arc<dyn ProductStore>,
    outbound_topic: String,
}

impl ProductService {
    pub fn new(store: Arc<dyn ProductStore>, outbound_topic: impl Into<String>) -> Self {
        Self {
            store,
            outbound_topic: outbound_topic.into(),
        }
    }

    fn intent(&self, kind: ProductEventKind, origin: WriteOrigin) -> Option<EventIntent> {
        origin
            .publishes_event()
            .then(|| EventIntent::new(kind, self.outbound_topic.clone()))
    }

    pub async fn create(
        &self,
        input: CreateProduct,
        origin: WriteOrigin,
    ) -> ServiceResult<Product> {
        input.ensure_valid()?;

        let product = self
            .store
            .insert(input, Utc::now(), self.intent(ProductEventKind::Created, origin))
            .await?;

        info!(
            product_id = product.id,
            origin = ?origin,
            "Product created"
        );
        Ok(product)
    }

    pub async fn update(
        &self,
        id: i64,
        patch: ProductPatch,
        origin: WriteOrigin,
    ) -> ServiceResult<Product> {
        if id <= 0 {
            return Err(ServiceError::Validation(format!(
                "product id must be positive, got {}",
                id
            )));
        }

        if patch.is_empty() {
            debug!(product_id = id, "Empty patch, only updated_at advances");
        }

        let product = self
            .store
            .update(
                id,
                patch,
                Utc::now(),
                self.intent(ProductEventKind::Updated, origin),
            )
            .await?;

        info!(
            product_id = product.id,
            origin = ?origin,
            "Product updated"
        );
        Ok(product)
    }

    pub async fn get(&self, id: i64) -> ServiceResult<Product> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("product {}", id)))
    }
}
