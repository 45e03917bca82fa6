// Graduation Control Plane Library
// Decision: Shared library for the server binary, the OpenAPI export binary and route tests

pub mod api;
pub mod config;
pub mod openapi;
pub mod provisioners;
pub mod seed;

use std::sync::Arc;

use axum::Router;
use graduation_durable::Orchestrator;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::StoreKind;
use crate::openapi::ApiDoc;

/// Build the full HTTP router: health, graduation routes, Swagger UI and request tracing
pub fn build_router(orchestrator: Arc<Orchestrator>, store: StoreKind) -> Router {
    let graduations_state = api::graduations::AppState::new(orchestrator);
    let health_state = api::health::HealthState { store };

    Router::new()
        .merge(api::health::routes(health_state))
        .merge(api::graduations::routes(graduations_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}
