pub mod admin;
pub mod health;
pub mod products;

use actix_web::{web, ResponseError};

use crate::error::ServiceError;

/// JSON extractor config: malformed bodies are answered with 422 like
/// other validation failures
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let service_error = ServiceError::Validation(err.to_string());
        actix_web::error::InternalError::from_response(err, service_error.error_response())
            .into()
    })
}
