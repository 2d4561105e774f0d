#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use product_service::domain::{CreateProduct, EventIntent, Product, ProductPatch, UpsertOutcome};
use product_service::error::{ServiceError, ServiceResult};
use product_service::repository::ProductStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use transactional_outbox::OutboxEvent;

/// In-memory `ProductStore` with the same semantics as the Postgres one.
/// Recorded outbox events are kept for inspection.
#[derive(Default)]
pub struct InMemoryProductStore {
    products: Mutex<BTreeMap<i64, Product>>,
    outbox: Mutex<Vec<OutboxEvent>>,
    /// Number of upserts that fail before one succeeds
    failing_upserts: AtomicU32,
    upsert_calls: AtomicU32,
}

impl InMemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_upserts(&self, count: u32) {
        self.failing_upserts.store(count, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> u32 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<OutboxEvent> {
        self.outbox.lock().unwrap().clone()
    }

    pub fn product(&self, id: i64) -> Option<Product> {
        self.products.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.products.lock().unwrap().len()
    }

    pub fn seed(&self, product: Product) {
        self.products.lock().unwrap().insert(product.id, product);
    }

    fn record(&self, intent: Option<EventIntent>, product: &Product) -> ServiceResult<()> {
        if let Some(intent) = intent {
            let event = intent.to_outbox_event(product)?;
            self.outbox.lock().unwrap().push(event);
        }
        Ok(())
    }
}

#[async_trait]
impl ProductStore for InMemoryProductStore {
    async fn find_by_id(&self, id: i64) -> ServiceResult<Option<Product>> {
        Ok(self.product(id))
    }

    async fn max_id(&self) -> ServiceResult<i64> {
        Ok(self
            .products
            .lock()
            .unwrap()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    async fn insert(
        &self,
        input: CreateProduct,
        now: DateTime<Utc>,
        intent: Option<EventIntent>,
    ) -> ServiceResult<Product> {
        let stored = {
            let mut products = self.products.lock().unwrap();
            let id = match input.id {
                Some(id) => id,
                None => products.keys().next_back().copied().unwrap_or(0) + 1,
            };
            if products.contains_key(&id) {
                return Err(ServiceError::Conflict(format!("product {} already exists", id)));
            }
            let product = input.into_product(id, now);
            products.insert(id, product.clone());
            product
        };

        self.record(intent, &stored)?;
        Ok(stored)
    }

    async fn update(
        &self,
        id: i64,
        patch: ProductPatch,
        now: DateTime<Utc>,
        intent: Option<EventIntent>,
    ) -> ServiceResult<Product> {
        let stored = {
            let mut products = self.products.lock().unwrap();
            let existing = products
                .get_mut(&id)
                .ok_or_else(|| ServiceError::NotFound(format!("product {}", id)))?;
            let merged = patch.merge_into(existing, now)?;
            *existing = merged.clone();
            merged
        };

        self.record(intent, &stored)?;
        Ok(stored)
    }

    async fn upsert(&self, product: &Product) -> ServiceResult<UpsertOutcome> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_upserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_upserts.store(remaining - 1, Ordering::SeqCst);
            return Err(ServiceError::Persistence(sqlx::Error::PoolTimedOut));
        }

        let mut products = self.products.lock().unwrap();
        match products.get_mut(&product.id) {
            None => {
                products.insert(product.id, product.clone());
                Ok(UpsertOutcome::Inserted)
            }
            Some(existing) if existing.updated_at <= product.updated_at => {
                let created_at = existing.created_at;
                *existing = Product {
                    created_at,
                    ..product.clone()
                };
                Ok(UpsertOutcome::Updated)
            }
            Some(_) => Ok(UpsertOutcome::Stale),
        }
    }
}

pub fn widget() -> CreateProduct {
    CreateProduct {
        id: None,
        name: "Widget".to_string(),
        brand: String::new(),
        description: String::new(),
        price: 9.99,
        stock: 10,
    }
}
