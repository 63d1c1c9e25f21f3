//! Operational HTTP surface: liveness and Prometheus scrape

use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer};
use serde_json::json;

use crate::metrics;

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics::serve_metrics));
}

/// Bind the ops server; the caller drives the returned future and stops it
/// through its handle.
pub fn server(port: u16) -> std::io::Result<Server> {
    Ok(HttpServer::new(|| App::new().configure(configure))
        .workers(1)
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run())
}
