use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::debug;
use transactional_outbox::{OutboxRepository, SqlxOutboxRepository};

use crate::domain::{CreateProduct, EventIntent, Product, ProductPatch, UpsertOutcome};
use crate::error::{ServiceError, ServiceResult};

/// Advisory lock key serializing id assignment across service instances
const PRODUCT_ID_LOCK: i64 = 0x5052_4f44_5543_5453; // "PRODUCTS"

const PRODUCT_COLUMNS: &str =
    "id, name, brand, price, description, stock, created_at, updated_at";

/// Durable product storage used by the write path and the merge worker
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> ServiceResult<Option<Product>>;

    /// Highest stored id, 0 when the store is empty
    async fn max_id(&self) -> ServiceResult<i64>;

    /// Insert a new product, assigning `max_id + 1` when the input has no id.
    /// When `intent` is set the announcing event commits together with the row.
    async fn insert(
        &self,
        input: CreateProduct,
        now: DateTime<Utc>,
        intent: Option<EventIntent>,
    ) -> ServiceResult<Product>;

    /// Merge `patch` onto the stored product and return the stored row.
    ///
    /// The read, the merge and the write happen under one row lock, so
    /// concurrent patches of different fields are all kept. `updated_at`
    /// never moves backwards; `created_at` is never written.
    async fn update(
        &self,
        id: i64,
        patch: ProductPatch,
        now: DateTime<Utc>,
        intent: Option<EventIntent>,
    ) -> ServiceResult<Product>;

    /// Insert or replace by id, ignoring snapshots older than the stored row.
    /// Serialized with id assignment, so a snapshot never takes an id that a
    /// concurrent create has just picked.
    async fn upsert(&self, product: &Product) -> ServiceResult<UpsertOutcome>;
}

/// PostgreSQL-backed product store
#[derive(Clone)]
pub struct PgProductRepository {
    pool: PgPool,
    outbox: Arc<SqlxOutboxRepository>,
}

impl PgProductRepository {
    pub fn new(pool: PgPool, outbox: Arc<SqlxOutboxRepository>) -> Self {
        Self { pool, outbox }
    }

    async fn record_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        intent: Option<EventIntent>,
        product: &Product,
    ) -> ServiceResult<()> {
        if let Some(intent) = intent {
            let event = intent.to_outbox_event(product)?;
            self.outbox.insert(tx, &event).await?;
            debug!(
                product_id = product.id,
                event_type = %event.event_type,
                "Product event recorded in outbox"
            );
        }
        Ok(())
    }
}

/// Held until commit/rollback
async fn lock_product_ids(tx: &mut Transaction<'_, Postgres>) -> ServiceResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(PRODUCT_ID_LOCK)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

#[async_trait]
impl ProductStore for PgProductRepository {
    async fn find_by_id(&self, id: i64) -> ServiceResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products WHERE id = $1",
            PRODUCT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    async fn max_id(&self) -> ServiceResult<i64> {
        let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM products")
            .fetch_one(&self.pool)
            .await?;

        Ok(max)
    }

    async fn insert(
        &self,
        input: CreateProduct,
        now: DateTime<Utc>,
        intent: Option<EventIntent>,
    ) -> ServiceResult<Product> {
        let mut tx = self.pool.begin().await?;
        lock_product_ids(&mut tx).await?;

        let id = match input.id {
            Some(id) => id,
            None => {
                let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM products")
                    .fetch_one(&mut *tx)
                    .await?;
                max + 1
            }
        };

        let candidate = input.into_product(id, now);
        let stored = sqlx::query_as::<_, Product>(&format!(
            r#"
            INSERT INTO products (id, name, brand, price, description, stock, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            PRODUCT_COLUMNS
        ))
        .bind(candidate.id)
        .bind(&candidate.name)
        .bind(&candidate.brand)
        .bind(candidate.price)
        .bind(&candidate.description)
        .bind(candidate.stock)
        .bind(candidate.created_at)
        .bind(candidate.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict(format!("product {} already exists", id))
            } else {
                ServiceError::Persistence(e)
            }
        })?;

        self.record_event(&mut tx, intent, &stored).await?;
        tx.commit().await?;

        Ok(stored)
    }

    async fn update(
        &self,
        id: i64,
        patch: ProductPatch,
        now: DateTime<Utc>,
        intent: Option<EventIntent>,
    ) -> ServiceResult<Product> {
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products WHERE id = $1 FOR UPDATE",
            PRODUCT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("product {}", id)))?;

        let merged = patch.merge_into(&stored, now)?;

        let updated = sqlx::query_as::<_, Product>(&format!(
            r#"
            UPDATE products
            SET name = $2,
                brand = $3,
                price = $4,
                description = $5,
                stock = $6,
                updated_at = $7
            WHERE id = $1
            RETURNING {}
            "#,
            PRODUCT_COLUMNS
        ))
        .bind(merged.id)
        .bind(&merged.name)
        .bind(&merged.brand)
        .bind(merged.price)
        .bind(&merged.description)
        .bind(merged.stock)
        .bind(merged.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        self.record_event(&mut tx, intent, &updated).await?;
        tx.commit().await?;

        Ok(updated)
    }

    async fn upsert(&self, product: &Product) -> ServiceResult<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        lock_product_ids(&mut tx).await?;

        // xmax = 0 only for freshly inserted tuples
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO products (id, name, brand, price, description, stock, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                brand = EXCLUDED.brand,
                price = EXCLUDED.price,
                description = EXCLUDED.description,
                stock = EXCLUDED.stock,
                updated_at = EXCLUDED.updated_at
            WHERE products.updated_at <= EXCLUDED.updated_at
            RETURNING (xmax = 0)
            "#,
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.brand)
        .bind(product.price)
        .bind(&product.description)
        .bind(product.stock)
        .bind(product.created_at)
        .bind(product.updated_at)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(match inserted {
            Some(true) => UpsertOutcome::Inserted,
            Some(false) => UpsertOutcome::Updated,
            None => UpsertOutcome::Stale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProductEventKind;

    async fn repository() -> PgProductRepository {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrate");
        sqlx::query("TRUNCATE products, outbox_events")
            .execute(&pool)
            .await
            .expect("truncate");
        let outbox = Arc::new(SqlxOutboxRepository::new(pool.clone()));
        PgProductRepository::new(pool, outbox)
    }

    fn widget() -> CreateProduct {
        CreateProduct {
            id: None,
            name: "Widget".to_string(),
            brand: String::new(),
            description: String::new(),
            price: 9.99,
            stock: 10,
        }
    }

    async fn pending_events(repo: &PgProductRepository) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE published_at IS NULL")
            .fetch_one(&repo.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL database"]
    async fn test_insert_assigns_next_id_and_records_event() {
        let repo = repository().await;
        assert_eq!(repo.max_id().await.unwrap(), 0);

        let intent = EventIntent::new(ProductEventKind::Created, "go-to-rails");
        let first = repo.insert(widget(), Utc::now(), Some(intent)).await.unwrap();
        let second = repo.insert(widget(), Utc::now(), None).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(repo.max_id().await.unwrap(), 2);
        assert_eq!(pending_events(&repo).await, 1);
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL database"]
    async fn test_duplicate_explicit_id_conflicts() {
        let repo = repository().await;
        let input = CreateProduct {
            id: Some(7),
            ..widget()
        };

        repo.insert(input.clone(), Utc::now(), None).await.unwrap();
        let err = repo.insert(input, Utc::now(), None).await.unwrap_err();

        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL database"]
    async fn test_update_keeps_created_at() {
        let repo = repository().await;
        let stored = repo.insert(widget(), Utc::now(), None).await.unwrap();

        let patch = ProductPatch {
            price: Some(12.5),
            ..Default::default()
        };
        let updated = repo.update(stored.id, patch, Utc::now(), None).await.unwrap();

        assert_eq!(updated.price, 12.5);
        assert_eq!(updated.created_at, stored.created_at);
        assert!(updated.updated_at >= stored.updated_at);
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL database"]
    async fn test_upsert_outcomes() {
        let repo = repository().await;
        let now = Utc::now();
        let snapshot = widget().into_product(40, now);

        assert_eq!(repo.upsert(&snapshot).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(repo.upsert(&snapshot).await.unwrap(), UpsertOutcome::Updated);

        let older = Product {
            name: "Old".to_string(),
            updated_at: now - chrono::Duration::hours(1),
            created_at: now - chrono::Duration::hours(2),
            ..snapshot.clone()
        };
        assert_eq!(repo.upsert(&older).await.unwrap(), UpsertOutcome::Stale);

        let stored = repo.find_by_id(40).await.unwrap().unwrap();
        assert_eq!(stored.name, "Widget");
        // Postgres keeps microsecond precision
        assert_eq!(
            stored.created_at.timestamp_micros(),
            snapshot.created_at.timestamp_micros()
        );
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL database"]
    async fn test_concurrent_patches_of_different_fields_are_both_kept() {
        let repo = repository().await;
        let stored = repo.insert(widget(), Utc::now(), None).await.unwrap();

        let price = ProductPatch {
            price: Some(12.5),
            ..Default::default()
        };
        let stock = ProductPatch {
            stock: Some(42),
            ..Default::default()
        };
        let (a, b) = tokio::join!(
            repo.update(stored.id, price, Utc::now(), None),
            repo.update(stored.id, stock, Utc::now(), None),
        );
        a.unwrap();
        b.unwrap();

        let after = repo.find_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(after.price, 12.5);
        assert_eq!(after.stock, 42);
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL database"]
    async fn test_auto_id_creates_never_collide_with_snapshots() {
        let repo = repository().await;
        let now = Utc::now();

        let creates = (0..20).map(|_| repo.insert(widget(), Utc::now(), None));
        let upserts: Vec<Product> = (1..=20).map(|id| widget().into_product(id, now)).collect();
        let (created, applied) = tokio::join!(
            futures::future::join_all(creates),
            futures::future::join_all(upserts.iter().map(|p| repo.upsert(p))),
        );

        for result in created {
            result.unwrap();
        }
        for result in applied {
            result.unwrap();
        }
    }
}
