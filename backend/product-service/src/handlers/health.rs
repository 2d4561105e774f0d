use actix_web::{web, HttpResponse};
use tokio::sync::watch;

use crate::consumers::WorkerState;

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Ready once the merge worker is consuming
pub async fn ready(state: web::Data<watch::Receiver<WorkerState>>) -> HttpResponse {
    let current = *state.borrow();
    let body = serde_json::json!({ "merge_worker": current });

    if current.is_ready() {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}
