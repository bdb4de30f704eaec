// API route configuration

use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        .service(
            web::scope("/api/v1")
                // Lookups
                .route(
                    "/products/ean/{ean}",
                    web::get().to(handlers::get_product_by_ean),
                )
                .route("/products/{id}", web::get().to(handlers::get_product))
                .route("/search", web::get().to(handlers::search_products))
                // Upstream passthrough
                .route("/categories", web::get().to(handlers::list_categories))
                .route(
                    "/categories/{id}",
                    web::get().to(handlers::get_category),
                )
                // Maintenance
                .route("/sync", web::post().to(handlers::trigger_sync))
                .route("/refresh", web::post().to(handlers::trigger_refresh)),
        );
}
