// OpenAPI specification generation
//
// Served by the API server at /api-doc/openapi.json and written out by the
// export-openapi binary.

use crate::api;
use utoipa::OpenApi;

/// OpenAPI documentation for the Keel control plane
#[derive(OpenApi)]
#[openapi(
    paths(
        api::workflows::start_workflow,
        api::workflows::cancel_workflow,
        api::workflows::list_running_workflows,
        api::workflows::get_workflow,
        api::schedules::schedule_action,
        api::schedules::create_schedule,
        api::schedules::list_schedules,
        api::schedules::get_schedule,
    ),
    components(
        schemas(
            api::workflows::StartWorkflowRequest,
            api::workflows::WorkflowStarted,
            api::workflows::WorkflowCancellationRequest,
            api::workflows::ActivityInfo,
            api::workflows::WorkflowDetailsResponse,
            api::workflows::RunErrorInfo,
            api::workflows::WorkflowRunResponse,
            api::schedules::CreateScheduleRequest,
            api::schedules::ScheduleActionRequest,
            api::schedules::ScheduledRun,
            api::schedules::ScheduleResponse,
        )
    ),
    tags(
        (name = "workflows", description = "Workflow run endpoints"),
        (name = "schedules", description = "Schedule management endpoints")
    ),
    info(
        title = "Keel Control Plane API",
        version = "0.2.0",
        description = "API for starting, cancelling and inspecting durable workflow runs and their schedules",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI spec as a pretty-printed JSON string
    pub fn to_json() -> Result<String, serde_json::Error> {
        Self::openapi().to_pretty_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_lists_every_route() {
        let spec = ApiDoc::openapi();
        let paths: Vec<&str> = spec.paths.paths.keys().map(String::as_str).collect();

        for path in [
            "/api/v1/workflows/workflows",
            "/api/v1/workflows/workflows/running",
            "/api/v1/workflows/workflows/{workflow_id}",
            "/api/v1/workflows/schedules",
            "/api/v1/workflows/schedules/{schedule_id}",
            "/api/v1/workflows/schedules/{schedule_id}/action",
        ] {
            assert!(paths.contains(&path), "missing {}", path);
        }
        assert!(ApiDoc::to_json().unwrap().contains("WorkflowDetailsResponse"));
    }
}
