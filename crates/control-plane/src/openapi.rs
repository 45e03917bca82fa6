// OpenAPI specification generation
//
// Used by the server (Swagger UI) and the export-openapi binary.

use crate::api;
use crate::api::{ErrorResponse, ListResponse};
use graduation_core::{
    ResourceRefs, Step, StepKind, StepOutput, StepStatus, Workflow, WorkflowStatus,
};
use utoipa::OpenApi;

/// OpenAPI documentation for the Graduation API
#[derive(OpenApi)]
#[openapi(
    paths(
        api::health::health,
        api::graduations::create_graduation,
        api::graduations::list_graduations,
        api::graduations::get_graduation,
        api::graduations::retry_graduation,
    ),
    components(
        schemas(
            Workflow, WorkflowStatus, ResourceRefs,
            Step, StepKind, StepStatus, StepOutput,
            api::graduations::CreateGraduationRequest,
            api::health::HealthResponse,
            ListResponse<Workflow>,
            ErrorResponse,
        )
    ),
    tags(
        (name = "graduations", description = "Graduation workflow endpoints"),
        (name = "health", description = "Service health")
    ),
    info(
        title = "Graduation API",
        version = "0.1.0",
        description = "API for graduating draft subjects into provisioned, active ones"
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Pretty-printed OpenAPI document
    pub fn to_json() -> String {
        Self::openapi()
            .to_pretty_json()
            .unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}
