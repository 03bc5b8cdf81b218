pub mod api;
pub mod config;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::services::scanner::BucketScanner;
use axum::{Router, routing::post};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::scan::trigger_scan,
        api::handlers::scan::scan_status,
    ),
    components(
        schemas(
            api::handlers::scan::ScanAccepted,
            api::handlers::scan::ScanStatus,
        )
    ),
    tags(
        (name = "scan", description = "Bucket scan trigger")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub scanner: Arc<BucketScanner>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route(
            "/scan",
            post(api::handlers::scan::trigger_scan).get(api::handlers::scan::scan_status),
        )
        .with_state(state)
}
