pub mod calls;
pub mod wsroute;

use crate::metrics;
use actix_web::{get, web, HttpResponse};
use serde::Serialize;

/// Success envelope shared by every REST handler
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

#[get("/metrics")]
pub async fn metrics_endpoint() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::gather())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(metrics_endpoint)
        .service(wsroute::ws_handler)
        .configure(calls::configure);
}
