/// Outbox admin endpoints for operational replay
use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use transactional_outbox::SqlxOutboxRepository;

use crate::domain::events::AGGREGATE_TYPE;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/admin/outbox/stats", web::get().to(outbox_stats))
        .route(
            "/admin/outbox/replay_since",
            web::post().to(outbox_replay_since),
        )
        .route(
            "/admin/outbox/replay_product",
            web::post().to(outbox_replay_product),
        );
}

pub async fn outbox_stats(repo: web::Data<Arc<SqlxOutboxRepository>>) -> impl Responder {
    match repo.pending_stats().await {
        Ok((count, age)) => HttpResponse::Ok().json(serde_json::json!({
            "pending_count": count,
            "oldest_pending_age_seconds": age,
        })),
        Err(e) => HttpResponse::InternalServerError().body(format!("error: {}", e)),
    }
}

#[derive(serde::Deserialize)]
pub struct ReplaySinceQuery {
    /// RFC3339 timestamp
    ts: String,
}

pub async fn outbox_replay_since(
    repo: web::Data<Arc<SqlxOutboxRepository>>,
    query: web::Query<ReplaySinceQuery>,
) -> impl Responder {
    match DateTime::parse_from_rfc3339(&query.ts).map(|dt| dt.with_timezone(&Utc)) {
        Ok(ts) => match repo.replay_since(ts).await {
            Ok(affected) => HttpResponse::Ok().json(serde_json::json!({
                "replayed": affected,
                "since": query.ts,
            })),
            Err(e) => HttpResponse::InternalServerError().body(format!("error: {}", e)),
        },
        Err(e) => HttpResponse::BadRequest().body(format!("invalid ts: {}", e)),
    }
}

#[derive(serde::Deserialize)]
pub struct ReplayProductQuery {
    product_id: i64,
}

pub async fn outbox_replay_product(
    repo: web::Data<Arc<SqlxOutboxRepository>>,
    query: web::Query<ReplayProductQuery>,
) -> impl Responder {
    match repo
        .replay_aggregate(AGGREGATE_TYPE, query.product_id)
        .await
    {
        Ok(affected) => HttpResponse::Ok().json(serde_json::json!({
            "replayed": affected,
            "product_id": query.product_id,
        })),
        Err(e) => HttpResponse::InternalServerError().body(format!("error: {}", e)),
    }
}
