/// Product handlers - HTTP endpoints for the write path
use actix_web::{web, HttpResponse};

use crate::domain::{CreateProduct, ProductPatch, WriteOrigin};
use crate::error::ServiceResult;
use crate::services::ProductService;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/products").route(web::post().to(create_product)))
        .service(
            web::resource("/products/{id}")
                .route(web::get().to(get_product))
                .route(web::put().to(update_product))
                .route(web::patch().to(update_product)),
        );
}

/// Create a product; the id is assigned when the body has none
pub async fn create_product(
    service: web::Data<ProductService>,
    body: web::Json<CreateProduct>,
) -> ServiceResult<HttpResponse> {
    let product = service.create(body.into_inner(), WriteOrigin::Api).await?;
    Ok(HttpResponse::Created().json(product))
}

pub async fn get_product(
    service: web::Data<ProductService>,
    id: web::Path<i64>,
) -> ServiceResult<HttpResponse> {
    let product = service.get(id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(product))
}

/// Partial update; fields missing from the body keep their stored value
pub async fn update_product(
    service: web::Data<ProductService>,
    id: web::Path<i64>,
    body: web::Json<ProductPatch>,
) -> ServiceResult<HttpResponse> {
    let product = service
        .update(id.into_inner(), body.into_inner(), WriteOrigin::Api)
        .await?;
    Ok(HttpResponse::Ok().json(product))
}
